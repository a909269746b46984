/*
 *  device/drivers/nusb_handle.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Real USB handles via nusb
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

use std::collections::VecDeque;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use log::{debug, info};
use nusb::transfer::{Queue, TransferError};

use crate::device::engine::{CompletionSink, Rejected, TransferId, TransferOutcome};
use crate::device::usb::{DeviceDescriptor, UsbError, UsbHandle};

const INTERFACE: u8 = 0;

/// Every attached device with this vendor/product pair, unopened
pub fn list_handles(vendor_id: u16, product_id: u16) -> Result<Vec<NusbHandle>, UsbError> {
    let devices = nusb::list_devices().map_err(|e| UsbError::Io(format!("USB enumeration: {}", e)))?;
    let handles: Vec<NusbHandle> = devices
        .filter(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
        .map(NusbHandle::new)
        .collect();
    info!("found {} device(s) {:04x}:{:04x}", handles.len(), vendor_id, product_id);
    Ok(handles)
}

/// One USB device; a single bulk OUT queue carries all transfers
pub struct NusbHandle {
    info: nusb::DeviceInfo,
    interface: Option<nusb::Interface>,
    queue: Option<(u8, Queue<Vec<u8>>)>,
    /// Sinks in submission order; the queue completes in the same order
    sinks: VecDeque<CompletionSink>,
}

impl NusbHandle {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        Self { info, interface: None, queue: None, sinks: VecDeque::new() }
    }

    fn queue_for(&mut self, endpoint: u8) -> Option<&mut Queue<Vec<u8>>> {
        let interface = self.interface.as_ref()?;
        if !matches!(self.queue, Some((ep, _)) if ep == endpoint) {
            self.queue = Some((endpoint, interface.bulk_out_queue(endpoint)));
        }
        self.queue.as_mut().map(|(_, q)| q)
    }

    /// Deliver whatever the queue has finished; returns how many
    fn drain_ready(&mut self) -> usize {
        let Some((_, queue)) = self.queue.as_mut() else { return 0 };
        let mut cx = Context::from_waker(Waker::noop());
        let mut delivered = 0;
        while queue.pending() > 0 {
            let Poll::Ready(completion) = queue.poll_next(&mut cx) else { break };
            let Some(sink) = self.sinks.pop_front() else {
                debug!("completion without a waiting transfer");
                continue;
            };
            let bytes = completion.data.actual_length();
            let outcome = match completion.status {
                Ok(()) => TransferOutcome::Success { bytes },
                Err(TransferError::Cancelled) => TransferOutcome::Cancelled,
                Err(e) => TransferOutcome::Failed(e.to_string()),
            };
            sink.complete(outcome, completion.data.reuse());
            delivered += 1;
        }
        delivered
    }
}

impl UsbHandle for NusbHandle {
    fn claim(&mut self) -> Result<(), UsbError> {
        if self.interface.is_some() {
            return Err(UsbError::Busy);
        }
        let device = self.info.open().map_err(|e| UsbError::Io(format!("USB open: {}", e)))?;
        let interface = device
            .claim_interface(INTERFACE)
            .map_err(|e| UsbError::Io(format!("claim interface {}: {}", INTERFACE, e)))?;
        self.interface = Some(interface);
        Ok(())
    }

    fn release(&mut self) {
        if let Some((_, mut queue)) = self.queue.take() {
            queue.cancel_all();
        }
        self.interface = None;
    }

    fn read_descriptor(&mut self) -> Result<DeviceDescriptor, UsbError> {
        if self.interface.is_none() {
            return Err(UsbError::NotClaimed);
        }
        Ok(DeviceDescriptor {
            vendor_id: self.info.vendor_id(),
            product_id: self.info.product_id(),
            bcd_device: self.info.device_version(),
        })
    }

    fn read_serial(&mut self) -> Result<String, UsbError> {
        self.info
            .serial_number()
            .map(str::to_string)
            .ok_or_else(|| UsbError::Io("no serial number string".into()))
    }

    fn submit_bulk(&mut self, endpoint: u8, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected> {
        let Some(queue) = self.queue_for(endpoint) else {
            return Err(Rejected { reason: UsbError::NotClaimed.to_string(), storage });
        };
        queue.submit(storage);
        self.sinks.push_back(sink);
        Ok(())
    }

    /// The queue cannot cancel one transfer, so this cancels all of them;
    /// the engine only cancels while closing
    fn cancel(&mut self, _id: TransferId) {
        if let Some((_, queue)) = self.queue.as_mut() {
            queue.cancel_all();
        }
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<(), UsbError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.drain_ready() > 0 || self.sinks.is_empty() || Instant::now() >= deadline {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
