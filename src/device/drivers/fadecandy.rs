/*
 *  device/drivers/fadecandy.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Fadecandy controller: 64-byte USB packets, on-board LUT and dithering
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

use serde_json::{json, Map, Value};

use crate::device::color::{ColorLut, LUT_ENTRIES};
use crate::device::error::DeviceError;
use crate::device::matching::{DeviceSettings, MapEntry};
use crate::device::traits::PixelFamily;
use crate::device::usb::DeviceDescriptor;
use crate::opc::{DeviceSpecificCommand, ProtocolFrame};

pub const VENDOR_ID: u16 = 0x1d50;
pub const PRODUCT_ID: u16 = 0x607a;

pub const PACKET_SIZE: usize = 64;
pub const FRAMEBUFFER_PACKETS: usize = 25;
pub const PIXELS_PER_PACKET: usize = 21;
pub const LUT_PACKETS: usize = 25;
pub const LUT_ENTRIES_PER_PACKET: usize = 31;
pub const MAX_PIXELS: usize = 512;

pub const TYPE_FRAMEBUFFER: u8 = 0x00;
pub const TYPE_LUT: u8 = 0x40;
pub const TYPE_CONFIG: u8 = 0x80;
pub const FINAL: u8 = 0x20;

pub const CFLAG_NO_DITHERING: u8 = 1 << 0;
pub const CFLAG_NO_INTERPOLATION: u8 = 1 << 1;
pub const CFLAG_NO_ACTIVITY_LED: u8 = 1 << 2;
pub const CFLAG_LED_CONTROL: u8 = 1 << 3;

/// Control byte for packet `index` of a `count` packet run
fn control(kind: u8, index: usize, count: usize) -> u8 {
    let last = if index + 1 == count { FINAL } else { 0 };
    kind | last | index as u8
}

pub struct FadecandyFamily {
    pixel_count: usize,
    map: Vec<MapEntry>,
    dither: bool,
    interpolate: bool,
    led: Option<bool>,
}

impl FadecandyFamily {
    pub fn new() -> Self {
        Self {
            pixel_count: MAX_PIXELS,
            map: vec![MapEntry(0, 0, 0, MAX_PIXELS)],
            dither: true,
            interpolate: true,
            led: None,
        }
    }

    /// Firmware configuration flags for the current settings
    pub fn config_flags(&self) -> u8 {
        let mut flags = 0;
        if !self.dither {
            flags |= CFLAG_NO_DITHERING;
        }
        if !self.interpolate {
            flags |= CFLAG_NO_INTERPOLATION;
        }
        match self.led {
            Some(true) => flags |= CFLAG_NO_ACTIVITY_LED | CFLAG_LED_CONTROL,
            Some(false) => flags |= CFLAG_NO_ACTIVITY_LED,
            None => {}
        }
        flags
    }

    fn config_packet(&self) -> Vec<u8> {
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[0] = TYPE_CONFIG;
        packet[1] = self.config_flags();
        packet
    }

    /// Byte offset of output pixel `index` inside the framebuffer transfer
    pub fn pixel_offset(index: usize) -> usize {
        (index / PIXELS_PER_PACKET) * PACKET_SIZE + 1 + (index % PIXELS_PER_PACKET) * 3
    }
}

impl Default for FadecandyFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelFamily for FadecandyFamily {
    fn type_string(&self) -> &'static str {
        "fadecandy"
    }

    fn display_name(&self) -> &'static str {
        "Fadecandy"
    }

    fn accepts(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.vendor_id == VENDOR_ID && descriptor.product_id == PRODUCT_ID
    }

    fn max_transfer_len(&self) -> usize {
        FRAMEBUFFER_PACKETS.max(LUT_PACKETS) * PACKET_SIZE
    }

    fn blank_image(&self) -> Vec<u8> {
        let mut image = vec![0u8; FRAMEBUFFER_PACKETS * PACKET_SIZE];
        for (index, packet) in image.chunks_exact_mut(PACKET_SIZE).enumerate() {
            packet[0] = control(TYPE_FRAMEBUFFER, index, FRAMEBUFFER_PACKETS);
        }
        image
    }

    fn pixel_count(&self) -> usize {
        self.pixel_count
    }

    fn configure(&mut self, settings: &DeviceSettings) -> Result<(), DeviceError> {
        let pixel_count = settings.pixel_count.unwrap_or(MAX_PIXELS);
        if pixel_count > MAX_PIXELS {
            return Err(DeviceError::MalformedConfig(format!(
                "pixelCount {} exceeds the {} pixels a Fadecandy drives",
                pixel_count, MAX_PIXELS
            )));
        }
        let map = settings.routed_map(pixel_count)?;

        self.pixel_count = pixel_count;
        self.map = map;
        self.dither = settings.dither.unwrap_or(true);
        self.interpolate = settings.interpolate.unwrap_or(true);
        self.led = settings.led;
        Ok(())
    }

    /// The controller applies its own LUT, so pixels go out raw
    fn render(&self, frame: &ProtocolFrame, _lut: &ColorLut, image: &mut [u8]) -> bool {
        let mut consumed = false;
        for entry in self.map.iter().filter(|e| e.channel() == frame.channel) {
            consumed = true;
            for k in 0..entry.count() {
                let src = (entry.first_opc_pixel() + k) * 3;
                let Some(rgb) = frame.payload.get(src..src + 3) else { break };
                let dst = Self::pixel_offset(entry.first_output_pixel() + k);
                image[dst..dst + 3].copy_from_slice(rgb);
            }
        }
        consumed
    }

    fn command(&mut self, cmd: &DeviceSpecificCommand, _image: &mut [u8]) -> Result<Option<Vec<u8>>, DeviceError> {
        if cmd.kind() != Some("device_options") {
            return Ok(None);
        }
        let doc = &cmd.document;
        let flag = |key: &str| -> Result<Option<bool>, DeviceError> {
            match doc.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Bool(b)) => Ok(Some(*b)),
                Some(other) => Err(DeviceError::MalformedConfig(format!("'{}' must be a boolean, got {}", key, other))),
            }
        };
        let (dither, interpolate) = (flag("dither")?, flag("interpolate")?);
        let led = match doc.get("led") {
            Some(_) => Some(flag("led")?),
            None => None,
        };
        // nothing changes unless every flag parsed
        if let Some(dither) = dither {
            self.dither = dither;
        }
        if let Some(interpolate) = interpolate {
            self.interpolate = interpolate;
        }
        if let Some(led) = led {
            self.led = led;
        }
        Ok(Some(self.config_packet()))
    }

    /// 25 packets of 31 little-endian entries: red, then green, then blue
    fn lut_upload(&self, lut: &ColorLut) -> Option<Vec<u8>> {
        let entries: Vec<u16> = (0..3).flat_map(|ch| lut.resampled(ch, LUT_ENTRIES)).collect();
        let mut out = vec![0u8; LUT_PACKETS * PACKET_SIZE];
        for (index, packet) in out.chunks_exact_mut(PACKET_SIZE).enumerate() {
            packet[0] = control(TYPE_LUT, index, LUT_PACKETS);
            let start = index * LUT_ENTRIES_PER_PACKET;
            for (slot, value) in entries.iter().skip(start).take(LUT_ENTRIES_PER_PACKET).enumerate() {
                let at = 2 + slot * 2;
                packet[at..at + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
        Some(out)
    }

    fn config_upload(&self) -> Option<Vec<u8>> {
        Some(self.config_packet())
    }

    fn describe(&self, out: &mut Map<String, Value>) {
        out.insert("dither".into(), json!(self.dither));
        out.insert("interpolate".into(), json!(self.interpolate));
        out.insert("led".into(), self.led.map_or(Value::Null, |b| json!(b)));
        out.insert("map".into(), json!(self.map));
    }
}
