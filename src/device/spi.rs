/*
 *  device/spi.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Port-addressed transport over a shared USB-to-SPI bridge
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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
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

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpiError {
    #[error("port {port} out of range (bridge has {count})")]
    PortOutOfRange { port: u32, count: u32 },
    #[error("port {0} is already bound")]
    PortBound(u32),
    #[error("port {0} is not bound")]
    PortUnbound(u32),
    #[error("{0}")]
    Io(String),
}

/// A bridge multiplexing several logical SPI ports over one USB connection.
///
/// The bridge's own connection is opened and closed by whoever created it;
/// devices only bind and write ports.
pub trait SpiBridge: Send {
    fn port_count(&self) -> u32;

    fn serial(&self) -> Option<String>;

    fn bind_port(&mut self, port: u32) -> Result<(), SpiError>;

    fn unbind_port(&mut self, port: u32);

    fn write(&mut self, port: u32, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected>;

    fn cancel(&mut self, id: TransferId);

    fn handle_events(&mut self, timeout: Duration) -> Result<(), SpiError>;
}

/// Bridge handle shared by every device bound to one of its ports
pub type SharedBridge = Arc<Mutex<dyn SpiBridge>>;

fn lock(bridge: &SharedBridge) -> MutexGuard<'_, dyn SpiBridge + 'static> {
    bridge.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PortWriter<'a> {
    bridge: &'a mut dyn SpiBridge,
    port: u32,
}

impl Submitter for PortWriter<'_> {
    fn submit(&mut self, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected> {
        self.bridge.write(self.port, storage, sink)
    }

    fn cancel(&mut self, id: TransferId) {
        self.bridge.cancel(id);
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<(), String> {
        self.bridge.handle_events(timeout).map_err(|e| e.to_string())
    }
}

/// One logical port of a shared bridge.
///
/// Writes hold the bridge lock from submission until the bridge has finished
/// with the buffer, so ports never interleave inside one bridge operation.
pub struct SpiTransport {
    bridge: SharedBridge,
    port: u32,
    engine: TransferEngine,
    bound: bool,
}

impl SpiTransport {
    pub fn new(bridge: SharedBridge, port: u32, policy: BufferPolicy, config: TransferConfig, buffer_len: usize) -> Self {
        Self {
            bridge,
            port,
            engine: TransferEngine::new(policy, config, buffer_len),
            bound: false,
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Run `f` against the engine with this port's writer, bridge locked
    fn with_port<R>(&mut self, f: impl FnOnce(&mut TransferEngine, &mut PortWriter<'_>) -> R) -> R {
        let mut guard = lock(&self.bridge);
        let mut writer = PortWriter { bridge: &mut *guard, port: self.port };
        f(&mut self.engine, &mut writer)
    }
}

impl Transport for SpiTransport {
    fn open(&mut self) -> Result<(), DeviceError> {
        lock(&self.bridge)
            .bind_port(self.port)
            .map_err(|e| DeviceError::OpenFailure(e.to_string()))?;
        self.bound = true;
        Ok(())
    }

    fn probe(&mut self, _family: &dyn PixelFamily) -> Result<(), DeviceError> {
        let count = lock(&self.bridge).port_count();
        if self.bound && self.port < count {
            Ok(())
        } else {
            Err(DeviceError::Bridge(SpiError::PortOutOfRange { port: self.port, count }.to_string()))
        }
    }

    fn identity(&self, family: &dyn PixelFamily) -> DeviceIdentity {
        DeviceIdentity::Spi { type_string: family.type_string(), port: self.port }
    }

    /// Synchronous: returns once the bridge has taken the whole buffer
    fn send(&mut self, data: &[u8]) -> Result<StageOutcome, DeviceError> {
        if !self.bound {
            return Err(DeviceError::NotOpen);
        }
        let outcome = self.engine.stage(data)?;
        if outcome == StageOutcome::Queued {
            self.with_port(|engine, writer| engine.wait_idle(writer))?;
        }
        Ok(outcome)
    }

    fn poll_events(&mut self) -> Result<(), DeviceError> {
        if !self.bound {
            return Ok(());
        }
        self.with_port(|engine, writer| {
            writer.handle_events(Duration::ZERO).map_err(DeviceError::Bridge)?;
            engine.reconcile();
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        if self.engine.is_dead() || self.engine.queued() == 0 {
            self.engine.reconcile();
            return self.engine.recycle();
        }
        debug!("port {}: resending {} queued write(s)", self.port, self.engine.queued());
        self.with_port(|engine, writer| engine.wait_idle(writer))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.bound {
            return Ok(());
        }
        let port = self.port;
        self.with_port(|engine, writer| {
            let result = engine.cancel_all(writer);
            writer.bridge.unbind_port(port);
            result
        })?;
        self.bound = false;
        Ok(())
    }

    fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    fn serial(&self) -> Option<&str> {
        None
    }

    fn name(&self, family: &dyn PixelFamily) -> String {
        match lock(&self.bridge).serial() {
            Some(serial) => format!("{} (Bridge {}, Port {})", family.display_name(), serial, self.port),
            None => format!("{} (Port {})", family.display_name(), self.port),
        }
    }

    fn describe(&self, out: &mut Map<String, Value>) {
        out.insert("port".into(), json!(self.port));
        out.insert("bridge".into(), lock(&self.bridge).serial().map_or(Value::Null, |s| json!(s)));
    }
}

/// SPI-backed device: one logical port of a shared bridge
pub type SpiDevice = PixelDevice<SpiTransport>;

impl PixelDevice<SpiTransport> {
    pub fn new(
        bridge: SharedBridge,
        port: u32,
        family: Box<dyn PixelFamily>,
        policy: BufferPolicy,
        config: TransferConfig,
    ) -> Self {
        let transport = SpiTransport::new(bridge, port, policy, config, family.max_transfer_len());
        Self::with_transport(transport, family)
    }

    pub fn port(&self) -> u32 {
        self.transport().port()
    }
}
