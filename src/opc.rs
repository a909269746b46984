/*
 *  opc.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Open Pixel Control message types consumed by devices
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use serde_json::Value;

/// Payload is packed 8-bit RGB triples
pub const CMD_SET_PIXEL_COLORS: u8 = 0x00;

/// Payload is vendor specific; ours carries a JSON document
pub const CMD_SYSTEM_EXCLUSIVE: u8 = 0xFF;

/// Size of the fixed OPC header: channel, command, length (big endian)
pub const HEADER_LEN: usize = 4;

/// One already-framed OPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    pub channel: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl ProtocolFrame {
    pub fn new(channel: u8, command: u8, payload: Vec<u8>) -> Self {
        Self { channel, command, payload }
    }

    /// Convenience for the common case: a set-pixel-colors frame
    pub fn pixels(channel: u8, rgb: Vec<u8>) -> Self {
        Self::new(channel, CMD_SET_PIXEL_COLORS, rgb)
    }

    /// Number of complete RGB pixels in a set-pixel-colors payload
    pub fn pixel_count(&self) -> usize {
        self.payload.len() / 3
    }

    /// Parse one frame from the head of `bytes`.
    ///
    /// Returns the frame and the number of bytes consumed, or `None` when the
    /// buffer does not yet hold a complete message.
    pub fn parse(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let total = HEADER_LEN + length;
        if bytes.len() < total {
            return None;
        }
        let frame = Self::new(bytes[0], bytes[1], bytes[HEADER_LEN..total].to_vec());
        Some((frame, total))
    }

    /// Serialize back to the wire layout
    pub fn to_wire(&self) -> Vec<u8> {
        let length = self.payload.len().min(u16::MAX as usize);
        let mut out = Vec::with_capacity(HEADER_LEN + length);
        out.push(self.channel);
        out.push(self.command);
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&self.payload[..length]);
        out
    }
}

/// Ad hoc JSON command that the streaming protocol cannot express
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpecificCommand {
    pub document: Value,
}

impl DeviceSpecificCommand {
    pub fn new(document: Value) -> Self {
        Self { document }
    }

    /// The command's `type` field, if it has one
    pub fn kind(&self) -> Option<&str> {
        self.document.get("type").and_then(Value::as_str)
    }
}

/// Everything a device can be asked to consume
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Frame(ProtocolFrame),
    Command(DeviceSpecificCommand),
}

impl Message {
    /// Lift a system-exclusive frame carrying JSON into a device command.
    /// Any other frame is returned unchanged.
    pub fn normalize(self) -> Self {
        match self {
            Message::Frame(frame) if frame.command == CMD_SYSTEM_EXCLUSIVE => {
                match serde_json::from_slice::<Value>(&frame.payload) {
                    Ok(document) => Message::Command(DeviceSpecificCommand::new(document)),
                    Err(_) => Message::Frame(frame),
                }
            }
            other => other,
        }
    }
}

impl From<ProtocolFrame> for Message {
    fn from(frame: ProtocolFrame) -> Self {
        Message::Frame(frame)
    }
}

impl From<DeviceSpecificCommand> for Message {
    fn from(command: DeviceSpecificCommand) -> Self {
        Message::Command(command)
    }
}
