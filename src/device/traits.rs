/*
 *  device/traits.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Core trait definitions for device abstraction
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

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::device::color::ColorLut;
use crate::device::engine::{StageOutcome, TransferEngine};
use crate::device::error::DeviceError;
use crate::device::matching::{ConfigMatcher, DeviceIdentity, DeviceSettings};
use crate::device::usb::DeviceDescriptor;
use crate::opc::{DeviceSpecificCommand, Message, ProtocolFrame};

/// Where a device is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Constructed, or closed again
    Closed,
    /// Handle claimed, family not yet confirmed
    Open,
    /// Open and confirmed by probe
    Ready,
    /// Isolated after a persistent fault; writes are discarded
    Dead,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Closed => "closed",
            DeviceStatus::Open => "open",
            DeviceStatus::Ready => "ready",
            DeviceStatus::Dead => "dead",
        }
    }
}

/// How a device took a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    /// Handed to the transfer engine
    Staged,
    /// Buffers busy; merged into the backlog drained by `flush()`
    Deferred,
    /// Valid, but nothing this hardware family acts on
    Acknowledged,
    /// Device is closed or dead
    Discarded,
}

/// Uniform capability surface the device manager talks to.
///
/// `open()` must succeed before anything else; configuration is applied only
/// after `probe_after_opening()` has confirmed the hardware family.
pub trait Device: Send {
    /// Claim the underlying hardware handle exclusively
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Confirm the opened handle really is this driver's hardware family.
    /// On `false` the caller must close and discard the device.
    fn probe_after_opening(&mut self) -> bool;

    /// Identity key used for configuration matching
    fn identity(&self) -> DeviceIdentity;

    /// Does this single configuration record describe this device?
    fn matches_entry(&self, entry: &Value) -> bool {
        ConfigMatcher::entry_matches(entry, &self.identity())
    }

    /// Apply one matched record, fully replacing earlier settings
    fn load_entry(&mut self, entry: &Value) -> Result<(), DeviceError>;

    /// Revert to hardware defaults and report as unconfigured
    fn mark_unconfigured(&mut self);

    /// Pure: true iff some record in `tree` describes this device
    fn match_configuration(&self, tree: &Value) -> bool {
        ConfigMatcher::records(tree).iter().any(|entry| self.matches_entry(entry))
    }

    /// Apply the first matching record of `tree`
    fn load_configuration(&mut self, tree: &Value) -> Result<(), DeviceError> {
        let entry = ConfigMatcher::records(tree)
            .iter()
            .find(|entry| self.matches_entry(entry))
            .cloned();
        match entry {
            Some(entry) => self.load_entry(&entry),
            None => {
                self.mark_unconfigured();
                Err(DeviceError::ConfigMismatch)
            }
        }
    }

    /// Stage an OPC frame or a device-specific command
    fn write_message(&mut self, msg: &Message) -> WriteAck;

    /// Install or replace the active lookup table; affects later writes only
    fn write_color_correction(&mut self, lut: ColorLut) -> Result<(), DeviceError>;

    /// Run the hardware stack's event step for this device. Completion
    /// notifications execute inside it.
    fn poll_events(&mut self) -> Result<(), DeviceError>;

    /// Reconcile finished transfers and resubmit queued work. Never call from
    /// inside a completion notification.
    fn flush(&mut self) -> Result<(), DeviceError>;

    /// Cancel in-flight transfers, wait for confirmation, release the handle
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Append identity and liveness fields to a status document
    fn describe(&self, out: &mut Map<String, Value>);

    fn status(&self) -> DeviceStatus;

    /// Wall-clock time of the last successful transfer, for stall detection
    fn last_success(&self) -> Option<DateTime<Utc>>;

    fn name(&self) -> String;
    fn serial(&self) -> Option<&str>;
    fn type_string(&self) -> &str;
}

/// Hardware-family strategy: how pixels and commands become transfer bytes
pub trait PixelFamily: Send {
    /// Stable configuration `type` string, e.g. `fadecandy`
    fn type_string(&self) -> &'static str;

    /// Human readable family name
    fn display_name(&self) -> &'static str;

    /// Whether an opened USB handle with this descriptor belongs to the family
    fn accepts(&self, _descriptor: &DeviceDescriptor) -> bool {
        false
    }

    /// Largest transfer this family ever stages
    fn max_transfer_len(&self) -> usize;

    /// Fresh output image for the current configuration
    fn blank_image(&self) -> Vec<u8>;

    fn pixel_count(&self) -> usize;

    /// Validate and apply settings; defaults fill anything missing
    fn configure(&mut self, settings: &DeviceSettings) -> Result<(), DeviceError>;

    /// Render a set-pixel-colors frame into `image`. Returns whether any
    /// mapping consumed the frame.
    fn render(&self, frame: &ProtocolFrame, lut: &ColorLut, image: &mut [u8]) -> bool;

    /// Handle a device-specific command. `Some(bytes)` is queued for
    /// transfer; `None` acknowledges without output.
    fn command(&mut self, cmd: &DeviceSpecificCommand, image: &mut [u8]) -> Result<Option<Vec<u8>>, DeviceError>;

    /// Bytes that load a new table into the hardware, or `None` when the
    /// table is applied host side during `render`
    fn lut_upload(&self, _lut: &ColorLut) -> Option<Vec<u8>> {
        None
    }

    /// Bytes to send after (re)configuration, if the hardware takes any
    fn config_upload(&self) -> Option<Vec<u8>> {
        None
    }

    fn describe(&self, out: &mut Map<String, Value>);
}

/// What a concrete transport brings to a [`PixelDevice`](crate::device::PixelDevice)
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Post-open identity confirmation for `family`
    fn probe(&mut self, family: &dyn PixelFamily) -> Result<(), DeviceError>;

    fn identity(&self, family: &dyn PixelFamily) -> DeviceIdentity;

    /// Stage `data` and start it on its way
    fn send(&mut self, data: &[u8]) -> Result<StageOutcome, DeviceError>;

    fn poll_events(&mut self) -> Result<(), DeviceError>;

    fn flush(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;

    fn engine(&self) -> &TransferEngine;

    fn serial(&self) -> Option<&str>;

    fn name(&self, family: &dyn PixelFamily) -> String;

    fn describe(&self, out: &mut Map<String, Value>);
}
