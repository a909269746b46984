/*
 *  device/usb.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  USB bulk transport and the USB-backed device
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

use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::device::buffer::BufferPolicy;
use crate::device::engine::{
    CompletionSink, Rejected, StageOutcome, Submitter, TransferConfig, TransferEngine, TransferId,
};
use crate::device::error::DeviceError;
use crate::device::matching::DeviceIdentity;
use crate::device::pixel_device::PixelDevice;
use crate::device::traits::{PixelFamily, Transport};

/// Fields of the standard USB device descriptor we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Firmware release in BCD, e.g. 0x0107 for 1.07
    pub bcd_device: u16,
}

impl DeviceDescriptor {
    pub fn version_string(&self) -> String {
        format!("{:x}.{:02x}", self.bcd_device >> 8, self.bcd_device & 0xFF)
    }
}

/// Errors reported by a USB stack
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsbError {
    #[error("handle is already claimed")]
    Busy,
    #[error("access denied")]
    Access,
    #[error("device is gone")]
    NoDevice,
    #[error("handle is not claimed")]
    NotClaimed,
    #[error("{0}")]
    Io(String),
}

/// A raw USB device handle as the hardware stack exposes it
pub trait UsbHandle: Send {
    /// Claim the device for exclusive use
    fn claim(&mut self) -> Result<(), UsbError>;

    fn release(&mut self);

    /// Needs a claimed handle
    fn read_descriptor(&mut self) -> Result<DeviceDescriptor, UsbError>;

    /// Needs a claimed handle
    fn read_serial(&mut self) -> Result<String, UsbError>;

    fn submit_bulk(&mut self, endpoint: u8, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected>;

    fn cancel(&mut self, id: TransferId);

    /// The stack's event step: completion notifications run in here
    fn handle_events(&mut self, timeout: Duration) -> Result<(), UsbError>;
}

/// One bulk OUT endpoint as a [`Submitter`]
struct BulkEndpoint<'a> {
    handle: &'a mut dyn UsbHandle,
    endpoint: u8,
}

impl Submitter for BulkEndpoint<'_> {
    fn submit(&mut self, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected> {
        self.handle.submit_bulk(self.endpoint, storage, sink)
    }

    fn cancel(&mut self, id: TransferId) {
        self.handle.cancel(id);
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<(), String> {
        self.handle.handle_events(timeout).map_err(|e| e.to_string())
    }
}

/// Exclusive USB handle plus the asynchronous transfer engine
pub struct UsbTransport {
    handle: Box<dyn UsbHandle>,
    engine: TransferEngine,
    endpoint: u8,
    descriptor: Option<DeviceDescriptor>,
    serial: Option<String>,
    open: bool,
}

impl UsbTransport {
    pub fn new(handle: Box<dyn UsbHandle>, policy: BufferPolicy, config: TransferConfig, buffer_len: usize) -> Self {
        let endpoint = config.endpoint;
        Self {
            handle,
            engine: TransferEngine::new(policy, config, buffer_len),
            endpoint,
            descriptor: None,
            serial: None,
            open: false,
        }
    }

    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.descriptor
    }

    fn endpoint(&mut self) -> (BulkEndpoint<'_>, &mut TransferEngine) {
        (
            BulkEndpoint { handle: self.handle.as_mut(), endpoint: self.endpoint },
            &mut self.engine,
        )
    }
}

impl Transport for UsbTransport {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.handle.claim().map_err(|e| DeviceError::OpenFailure(e.to_string()))?;
        let descriptor = match self.handle.read_descriptor() {
            Ok(d) => d,
            Err(e) => {
                self.handle.release();
                return Err(DeviceError::OpenFailure(format!("descriptor: {}", e)));
            }
        };
        self.descriptor = Some(descriptor);
        self.serial = match self.handle.read_serial() {
            Ok(serial) => Some(serial),
            Err(e) => {
                warn!("device {:04x}:{:04x} has no readable serial: {}", descriptor.vendor_id, descriptor.product_id, e);
                None
            }
        };
        self.open = true;
        Ok(())
    }

    fn probe(&mut self, family: &dyn PixelFamily) -> Result<(), DeviceError> {
        let descriptor = self.descriptor.ok_or(DeviceError::NotOpen)?;
        if family.accepts(&descriptor) {
            Ok(())
        } else {
            Err(DeviceError::ProbeMismatch {
                expected: family.type_string(),
                vendor_id: descriptor.vendor_id,
                product_id: descriptor.product_id,
            })
        }
    }

    fn identity(&self, family: &dyn PixelFamily) -> DeviceIdentity {
        let descriptor = self.descriptor.unwrap_or(DeviceDescriptor { vendor_id: 0, product_id: 0, bcd_device: 0 });
        DeviceIdentity::Usb {
            type_string: family.type_string(),
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            serial: self.serial.clone(),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<StageOutcome, DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        let outcome = self.engine.stage(data)?;
        if outcome == StageOutcome::Queued {
            let (mut ep, engine) = self.endpoint();
            engine.pump(&mut ep)?;
        }
        Ok(outcome)
    }

    fn poll_events(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Ok(());
        }
        let (mut ep, engine) = self.endpoint();
        if let Err(e) = ep.handle_events(Duration::ZERO) {
            debug!("usb event step failed: {}", e);
            if !engine.is_dead() {
                engine.mark_dead();
            }
            return Err(DeviceError::EventStep(e));
        }
        engine.reconcile();
        engine.pump(&mut ep).map(|_| ())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        let (mut ep, engine) = self.endpoint();
        engine.flush(&mut ep)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Ok(());
        }
        let (mut ep, engine) = self.endpoint();
        engine.cancel_all(&mut ep)?;
        self.handle.release();
        self.open = false;
        Ok(())
    }

    fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn name(&self, family: &dyn PixelFamily) -> String {
        match (&self.serial, self.descriptor) {
            (Some(serial), Some(d)) => {
                format!("{} (Serial# {}, Version {})", family.display_name(), serial, d.version_string())
            }
            (None, Some(d)) => format!("{} (Version {})", family.display_name(), d.version_string()),
            _ => family.display_name().to_string(),
        }
    }

    fn describe(&self, out: &mut Map<String, Value>) {
        out.insert("serial".into(), self.serial.as_ref().map_or(Value::Null, |s| json!(s)));
        if let Some(d) = self.descriptor {
            out.insert("version".into(), json!(d.version_string()));
            out.insert("bcd_version".into(), json!(d.bcd_device));
        }
    }
}

/// USB-backed device: an exclusive handle driven by a family strategy
pub type UsbDevice = PixelDevice<UsbTransport>;

impl PixelDevice<UsbTransport> {
    pub fn new(
        handle: Box<dyn UsbHandle>,
        family: Box<dyn PixelFamily>,
        policy: BufferPolicy,
        config: TransferConfig,
    ) -> Self {
        let transport = UsbTransport::new(handle, policy, config, family.max_transfer_len());
        Self::with_transport(transport, family)
    }

    /// Firmware version from the descriptor, once opened
    pub fn firmware_version(&self) -> Option<String> {
        self.transport().descriptor().map(|d| d.version_string())
    }
}
