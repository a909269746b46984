/*
 *  device/drivers/sim.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Simulated USB stack and SPI bridge for running without hardware
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

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::device::drivers::fadecandy;
use crate::device::engine::{CompletionSink, Rejected, TransferId, TransferOutcome};
use crate::device::spi::{SpiBridge, SpiError};
use crate::device::usb::{DeviceDescriptor, UsbError, UsbHandle};

/// A transfer the simulated hardware has accepted but not finished
#[derive(Debug)]
pub struct SimTransfer {
    /// Endpoint (USB) or port (SPI)
    pub target: u32,
    pub data: Vec<u8>,
    sink: CompletionSink,
}

impl SimTransfer {
    pub fn id(&self) -> TransferId {
        self.sink.id()
    }
}

/// Transfers in submission order plus everything that reached the wire
#[derive(Debug, Default)]
pub struct SimQueue {
    pub pending: VecDeque<SimTransfer>,
    /// Completed transfers as `(target, bytes)`, in completion order
    pub wire: Vec<(u32, Vec<u8>)>,
    pub submitted: u64,
}

impl SimQueue {
    fn accept(&mut self, target: u32, data: Vec<u8>, sink: CompletionSink) {
        self.submitted += 1;
        self.pending.push_back(SimTransfer { target, data, sink });
    }

    /// Finish the oldest pending transfer successfully
    pub fn complete_next(&mut self) -> bool {
        let Some(t) = self.pending.pop_front() else { return false };
        self.wire.push((t.target, t.data.clone()));
        t.sink.complete(TransferOutcome::Success { bytes: t.data.len() }, t.data);
        true
    }

    pub fn complete_all(&mut self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    /// Fail the oldest pending transfer; nothing reaches the wire
    pub fn fail_next(&mut self, reason: &str) -> bool {
        let Some(t) = self.pending.pop_front() else { return false };
        t.sink.complete(TransferOutcome::Failed(reason.to_string()), t.data);
        true
    }

    fn cancel(&mut self, id: TransferId) {
        if let Some(pos) = self.pending.iter().position(|t| t.id() == id) {
            if let Some(t) = self.pending.remove(pos) {
                t.sink.complete(TransferOutcome::Cancelled, t.data);
            }
        }
    }

    /// Bytes that reached `target`, oldest first
    pub fn wire_for(&self, target: u32) -> Vec<Vec<u8>> {
        self.wire.iter().filter(|(t, _)| *t == target).map(|(_, d)| d.clone()).collect()
    }
}

/// Internal state of a simulated USB device (shared for inspection in tests)
#[derive(Debug)]
pub struct SimUsbState {
    pub descriptor: DeviceDescriptor,
    pub serial: Option<String>,
    pub claimed: bool,
    pub queue: SimQueue,

    /// Complete everything pending on each event step
    pub auto_complete: bool,
    pub fail_claim: bool,
    pub reject_submits: bool,
    pub ignore_cancel: bool,
    pub fail_events: bool,
}

/// Simulated USB device handle
#[derive(Debug, Clone)]
pub struct SimUsbHandle {
    state: Arc<Mutex<SimUsbState>>,
}

impl SimUsbHandle {
    pub fn new(descriptor: DeviceDescriptor, serial: Option<&str>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimUsbState {
                descriptor,
                serial: serial.map(str::to_string),
                claimed: false,
                queue: SimQueue::default(),
                auto_complete: true,
                fail_claim: false,
                reject_submits: false,
                ignore_cancel: false,
                fail_events: false,
            })),
        }
    }

    /// A Fadecandy with firmware 1.07
    pub fn fadecandy(serial: &str) -> Self {
        Self::new(
            DeviceDescriptor {
                vendor_id: fadecandy::VENDOR_ID,
                product_id: fadecandy::PRODUCT_ID,
                bcd_device: 0x0107,
            },
            Some(serial),
        )
    }

    /// Get reference to state for inspection in tests
    pub fn state(&self) -> Arc<Mutex<SimUsbState>> {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> MutexGuard<'_, SimUsbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsbHandle for SimUsbHandle {
    fn claim(&mut self) -> Result<(), UsbError> {
        let mut state = self.lock();
        if state.fail_claim {
            return Err(UsbError::Access);
        }
        if state.claimed {
            return Err(UsbError::Busy);
        }
        state.claimed = true;
        Ok(())
    }

    fn release(&mut self) {
        self.lock().claimed = false;
    }

    fn read_descriptor(&mut self) -> Result<DeviceDescriptor, UsbError> {
        let state = self.lock();
        if !state.claimed {
            return Err(UsbError::NotClaimed);
        }
        Ok(state.descriptor)
    }

    fn read_serial(&mut self) -> Result<String, UsbError> {
        let state = self.lock();
        if !state.claimed {
            return Err(UsbError::NotClaimed);
        }
        state.serial.clone().ok_or_else(|| UsbError::Io("no serial number string".into()))
    }

    fn submit_bulk(&mut self, endpoint: u8, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected> {
        let mut state = self.lock();
        if !state.claimed {
            return Err(Rejected { reason: "interface not claimed".into(), storage });
        }
        if state.reject_submits {
            return Err(Rejected { reason: "endpoint stalled".into(), storage });
        }
        state.queue.accept(endpoint as u32, storage, sink);
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) {
        let mut state = self.lock();
        if !state.ignore_cancel {
            state.queue.cancel(id);
        }
    }

    fn handle_events(&mut self, _timeout: Duration) -> Result<(), UsbError> {
        let mut state = self.lock();
        if state.fail_events {
            return Err(UsbError::NoDevice);
        }
        if state.auto_complete {
            state.queue.complete_all();
        }
        Ok(())
    }
}

/// Internal state of a simulated SPI bridge (shared for inspection in tests)
#[derive(Debug)]
pub struct SimBridgeState {
    pub serial: Option<String>,
    pub port_count: u32,
    pub bound: BTreeSet<u32>,
    pub queue: SimQueue,

    pub auto_complete: bool,
    pub reject_writes: bool,
    pub ignore_cancel: bool,
}

/// Simulated USB-to-SPI bridge
#[derive(Debug)]
pub struct SimBridge {
    state: Arc<Mutex<SimBridgeState>>,
}

impl SimBridge {
    pub fn new(serial: Option<&str>, port_count: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimBridgeState {
                serial: serial.map(str::to_string),
                port_count,
                bound: BTreeSet::new(),
                queue: SimQueue::default(),
                auto_complete: true,
                reject_writes: false,
                ignore_cancel: false,
            })),
        }
    }

    pub fn state(&self) -> Arc<Mutex<SimBridgeState>> {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> MutexGuard<'_, SimBridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpiBridge for SimBridge {
    fn port_count(&self) -> u32 {
        self.lock().port_count
    }

    fn serial(&self) -> Option<String> {
        self.lock().serial.clone()
    }

    fn bind_port(&mut self, port: u32) -> Result<(), SpiError> {
        let mut state = self.lock();
        if port >= state.port_count {
            return Err(SpiError::PortOutOfRange { port, count: state.port_count });
        }
        if !state.bound.insert(port) {
            return Err(SpiError::PortBound(port));
        }
        Ok(())
    }

    fn unbind_port(&mut self, port: u32) {
        self.lock().bound.remove(&port);
    }

    fn write(&mut self, port: u32, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected> {
        let mut state = self.lock();
        if !state.bound.contains(&port) {
            return Err(Rejected { reason: SpiError::PortUnbound(port).to_string(), storage });
        }
        if state.reject_writes {
            return Err(Rejected { reason: "bridge NAK".into(), storage });
        }
        state.queue.accept(port, storage, sink);
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) {
        let mut state = self.lock();
        if !state.ignore_cancel {
            state.queue.cancel(id);
        }
    }

    fn handle_events(&mut self, _timeout: Duration) -> Result<(), SpiError> {
        let mut state = self.lock();
        if state.auto_complete {
            state.queue.complete_all();
        }
        Ok(())
    }
}
