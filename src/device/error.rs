/*
 *  device/error.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Unified error types for the device subsystem
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

use thiserror::Error;

use crate::device::buffer::BufferState;

/// Unified error type for all device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Hardware handle could not be claimed (permissions, in use, absent)
    #[error("Failed to open device: {0}")]
    OpenFailure(String),

    /// The opened handle belongs to a different hardware family
    #[error("Opened handle is not a {expected} (vendor 0x{vendor_id:04x}, product 0x{product_id:04x})")]
    ProbeMismatch {
        expected: &'static str,
        vendor_id: u16,
        product_id: u16,
    },

    /// Operation requires `open()` first
    #[error("Device is not open")]
    NotOpen,

    /// Configuration may only be applied once family identity is confirmed
    #[error("Device identity has not been confirmed by probe")]
    NotProbed,

    /// No configuration record describes this device
    #[error("No configuration entry matches this device")]
    ConfigMismatch,

    /// A matched record carries a required field of the wrong type
    #[error("Malformed configuration: {0}")]
    MalformedConfig(String),

    /// The hardware stack kept rejecting submissions
    #[error("Transfer submission failed after {attempts} attempt(s): {reason}")]
    TransferSubmit { attempts: u32, reason: String },

    /// The hardware stack's event step failed; the device is isolated
    #[error("Hardware event step failed: {0}")]
    EventStep(String),

    /// No transfer buffer could be allocated
    #[error("Transfer buffers exhausted")]
    BufferExhausted,

    /// In-flight transfers could not be confirmed cancelled during close
    #[error("Failed to cancel in-flight transfers: {0}")]
    CancelFailed(String),

    /// The device has been isolated after a persistent fault
    #[error("Device is dead")]
    Dead,

    /// No driver knows this configuration `type`
    #[error("Unsupported device type '{0}'")]
    UnsupportedType(String),

    /// SPI bridge communication error
    #[error("SPI bridge error: {0}")]
    Bridge(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl DeviceError {
    /// Faults that must reach whoever owns this device's lifecycle.
    /// Everything else degrades only the device that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::BufferExhausted | DeviceError::CancelFailed(_))
    }
}

/// Illegal use of a transfer buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Illegal buffer transition {from:?} -> {to:?}")]
    IllegalTransition { from: BufferState, to: BufferState },

    #[error("Staged data of {len} bytes exceeds buffer capacity {capacity}")]
    Oversize { len: usize, capacity: usize },

    #[error("Buffer storage is held by the hardware stack")]
    StorageLent,
}

/// Handle arena errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Unknown handle id {0}")]
    UnknownHandle(u64),

    #[error("Handle {id} is still leased by {users} user(s)")]
    InUse { id: u64, users: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DeviceError::BufferExhausted.is_fatal());
        assert!(DeviceError::CancelFailed("timeout".into()).is_fatal());
        assert!(!DeviceError::Dead.is_fatal());
        assert!(!DeviceError::ConfigMismatch.is_fatal());
        assert!(!DeviceError::TransferSubmit { attempts: 3, reason: "stall".into() }.is_fatal());
    }

    #[test]
    fn test_probe_mismatch_message() {
        let err = DeviceError::ProbeMismatch { expected: "fadecandy", vendor_id: 0x1d50, product_id: 0x1 };
        assert_eq!(
            err.to_string(),
            "Opened handle is not a fadecandy (vendor 0x1d50, product 0x0001)"
        );
    }
}
