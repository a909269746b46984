/*
 *  device/pixel_device.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device composed from a transport and a hardware-family strategy
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

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde_json::{json, Map, Value};

use crate::device::color::ColorLut;
use crate::device::engine::StageOutcome;
use crate::device::error::DeviceError;
use crate::device::matching::{ConfigMatcher, DeviceIdentity, DeviceSettings};
use crate::device::traits::{Device, DeviceStatus, PixelFamily, Transport, WriteAck};
use crate::opc::{Message, CMD_SET_PIXEL_COLORS};

/// Configuration state reported by `describe()`
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigState {
    Unconfigured,
    Configured,
    Rejected(String),
}

/// Work waiting for a free transfer buffer, in write order
#[derive(Debug)]
enum Backlog {
    /// The image as it was written; a later frame replaces a trailing one
    Frame(Vec<u8>),
    Control(Vec<u8>),
}

impl Backlog {
    fn bytes(&self) -> &[u8] {
        match self {
            Backlog::Frame(bytes) | Backlog::Control(bytes) => bytes,
        }
    }
}

/// A [`Device`] assembled from a transport and a family strategy
pub struct PixelDevice<T: Transport> {
    transport: T,
    family: Box<dyn PixelFamily>,
    status: DeviceStatus,
    probed: bool,
    config: ConfigState,
    settings: DeviceSettings,
    lut: ColorLut,
    image: Vec<u8>,
    backlog: VecDeque<Backlog>,
    deferred: u64,
}

impl<T: Transport> PixelDevice<T> {
    pub fn with_transport(transport: T, family: Box<dyn PixelFamily>) -> Self {
        let image = family.blank_image();
        Self {
            transport,
            family,
            status: DeviceStatus::Closed,
            probed: false,
            config: ConfigState::Unconfigured,
            settings: DeviceSettings::default(),
            lut: ColorLut::identity(),
            image,
            backlog: VecDeque::new(),
            deferred: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config_state(&self) -> &ConfigState {
        &self.config
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn pixel_count(&self) -> usize {
        self.family.pixel_count()
    }

    /// Work held back because every buffer was busy
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn accepting(&self) -> bool {
        matches!(self.status, DeviceStatus::Open | DeviceStatus::Ready)
    }

    /// Submission faults degrade this device only
    fn absorb(&mut self, err: DeviceError) -> DeviceError {
        if self.transport.engine().is_dead() && self.status != DeviceStatus::Dead {
            warn!("{}: isolating device: {}", self.name(), err);
            self.status = DeviceStatus::Dead;
            self.backlog.clear();
        }
        err
    }

    fn enqueue_frame(&mut self) -> WriteAck {
        if self.backlog.is_empty() {
            let result = self.transport.send(&self.image);
            if let Some(ack) = self.settle(result) {
                return ack;
            }
        }
        self.defer_frame();
        WriteAck::Deferred
    }

    fn enqueue_control(&mut self, bytes: Vec<u8>) -> WriteAck {
        if self.backlog.is_empty() {
            let result = self.transport.send(&bytes);
            if let Some(ack) = self.settle(result) {
                return ack;
            }
        }
        self.defer(Backlog::Control(bytes));
        WriteAck::Deferred
    }

    /// Acknowledgement for a staging attempt, `None` when every buffer is busy
    fn settle(&mut self, result: Result<StageOutcome, DeviceError>) -> Option<WriteAck> {
        match result {
            Ok(StageOutcome::Queued) => Some(WriteAck::Staged),
            Ok(StageOutcome::Busy) => None,
            Ok(StageOutcome::Discarded) => Some(WriteAck::Discarded),
            Err(e) => {
                // the data stays queued in the engine unless this killed it
                let e = self.absorb(e);
                debug!("{}: write not yet submitted: {}", self.name(), e);
                if self.status == DeviceStatus::Dead {
                    Some(WriteAck::Discarded)
                } else {
                    Some(WriteAck::Staged)
                }
            }
        }
    }

    /// Hold a copy of the current image. Only a frame at the tail is
    /// replaced, so frames never jump ahead of control packets.
    fn defer_frame(&mut self) {
        if let Some(Backlog::Frame(pending)) = self.backlog.back_mut() {
            pending.clone_from(&self.image);
            return;
        }
        self.defer(Backlog::Frame(self.image.clone()));
    }

    fn defer(&mut self, item: Backlog) {
        self.deferred += 1;
        self.backlog.push_back(item);
    }

    /// Stage backlog entries until buffers run out again
    fn drain_backlog(&mut self) -> Result<(), DeviceError> {
        while let Some(item) = self.backlog.front() {
            let outcome = self.transport.send(item.bytes());
            match outcome {
                Ok(StageOutcome::Queued) => {
                    self.backlog.pop_front();
                }
                Ok(StageOutcome::Busy) => break,
                Ok(StageOutcome::Discarded) => {
                    self.backlog.clear();
                    break;
                }
                Err(e) => {
                    // staged in the engine before submission failed
                    self.backlog.pop_front();
                    return Err(self.absorb(e));
                }
            }
        }
        Ok(())
    }

    fn apply_settings(&mut self, settings: DeviceSettings) -> Result<(), DeviceError> {
        self.family.configure(&settings)?;
        self.settings = settings;
        self.image = self.family.blank_image();
        // frames staged under the old layout are stale
        self.backlog.retain(|item| matches!(item, Backlog::Control(_)));
        if self.accepting() {
            if let Some(bytes) = self.family.config_upload() {
                self.enqueue_control(bytes);
            }
        }
        Ok(())
    }
}

impl<T: Transport> Device for PixelDevice<T> {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.status != DeviceStatus::Closed {
            return Err(DeviceError::OpenFailure(format!("device is already {}", self.status.as_str())));
        }
        match self.transport.open() {
            Ok(()) => {
                self.status = DeviceStatus::Open;
                info!("opened {}", self.name());
                Ok(())
            }
            Err(e) => {
                warn!("{} failed to open: {}", self.family.display_name(), e);
                self.status = DeviceStatus::Dead;
                Err(e)
            }
        }
    }

    fn probe_after_opening(&mut self) -> bool {
        if !self.accepting() {
            return false;
        }
        match self.transport.probe(self.family.as_ref()) {
            Ok(()) => {
                self.probed = true;
                self.status = DeviceStatus::Ready;
                true
            }
            Err(e) => {
                debug!("probe rejected candidate {}: {}", self.family.type_string(), e);
                false
            }
        }
    }

    fn identity(&self) -> DeviceIdentity {
        self.transport.identity(self.family.as_ref())
    }

    fn load_entry(&mut self, entry: &Value) -> Result<(), DeviceError> {
        if !self.probed {
            return Err(DeviceError::NotProbed);
        }
        let result = ConfigMatcher::settings_for(entry, &self.identity())
            .and_then(|settings| self.apply_settings(settings));
        match &result {
            Ok(()) => {
                self.config = ConfigState::Configured;
                info!("{}: configuration loaded ({} pixels)", self.name(), self.family.pixel_count());
            }
            Err(e) => {
                // a rejected entry leaves the hardware defaults in charge
                if let Err(reset) = self.apply_settings(DeviceSettings::default()) {
                    warn!("{}: cannot restore defaults: {}", self.name(), reset);
                }
                self.config = ConfigState::Rejected(e.to_string());
            }
        }
        result
    }

    fn mark_unconfigured(&mut self) {
        if let Err(e) = self.apply_settings(DeviceSettings::default()) {
            warn!("{}: cannot restore defaults: {}", self.name(), e);
        }
        self.config = ConfigState::Unconfigured;
    }

    fn write_message(&mut self, msg: &Message) -> WriteAck {
        if !self.accepting() {
            return WriteAck::Discarded;
        }
        match msg.clone().normalize() {
            Message::Frame(frame) => {
                if frame.command != CMD_SET_PIXEL_COLORS {
                    return WriteAck::Acknowledged;
                }
                if !self.family.render(&frame, &self.lut, &mut self.image) {
                    return WriteAck::Acknowledged;
                }
                self.enqueue_frame()
            }
            Message::Command(cmd) => match self.family.command(&cmd, &mut self.image) {
                Ok(Some(bytes)) => self.enqueue_control(bytes),
                Ok(None) => WriteAck::Acknowledged,
                Err(e) => {
                    warn!("{}: ignoring command {:?}: {}", self.name(), cmd.kind(), e);
                    WriteAck::Acknowledged
                }
            },
        }
    }

    fn write_color_correction(&mut self, lut: ColorLut) -> Result<(), DeviceError> {
        match self.status {
            DeviceStatus::Closed => return Err(DeviceError::NotOpen),
            DeviceStatus::Dead => return Ok(()),
            _ => {}
        }
        if let Some(bytes) = self.family.lut_upload(&lut) {
            self.enqueue_control(bytes);
        }
        self.lut = lut;
        Ok(())
    }

    fn poll_events(&mut self) -> Result<(), DeviceError> {
        if self.status == DeviceStatus::Closed {
            return Ok(());
        }
        self.transport.poll_events().map_err(|e| self.absorb(e))
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        match self.status {
            DeviceStatus::Closed => return Err(DeviceError::NotOpen),
            DeviceStatus::Dead => {
                // reconcile only; a dead engine never resubmits
                return self.transport.flush().or(Ok(()));
            }
            _ => {}
        }
        self.transport.flush().map_err(|e| self.absorb(e))?;
        self.drain_backlog()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.status == DeviceStatus::Closed {
            return Ok(());
        }
        self.backlog.clear();
        self.transport.close()?;
        self.probed = false;
        if self.status == DeviceStatus::Dead {
            // released, but a dead device never comes back
            return Ok(());
        }
        info!("closed {}", self.name());
        self.status = DeviceStatus::Closed;
        Ok(())
    }

    fn describe(&self, out: &mut Map<String, Value>) {
        out.insert("type".into(), json!(self.family.type_string()));
        self.transport.describe(out);
        out.insert("name".into(), json!(self.name()));
        out.insert("status".into(), json!(self.status.as_str()));
        let config = match &self.config {
            ConfigState::Unconfigured => json!("unconfigured"),
            ConfigState::Configured => json!("configured"),
            ConfigState::Rejected(reason) => {
                out.insert("configError".into(), json!(reason));
                json!("rejected")
            }
        };
        out.insert("config".into(), config);
        out.insert("pixelCount".into(), json!(self.family.pixel_count()));
        if let Some(gamma) = self.settings.gamma {
            out.insert("gamma".into(), json!(gamma));
        }
        if let Some(whitepoint) = self.settings.whitepoint {
            out.insert("whitepoint".into(), json!(whitepoint));
        }
        self.family.describe(out);

        let engine = self.transport.engine();
        out.insert("bufferPolicy".into(), json!(engine.policy().to_string()));
        out.insert(
            "lastSuccess".into(),
            engine
                .last_success()
                .map_or(Value::Null, |t| json!(t.to_rfc3339_opts(SecondsFormat::Millis, true))),
        );
        out.insert("transfers".into(), serde_json::to_value(engine.stats()).unwrap_or(Value::Null));
        out.insert("deferred".into(), json!(self.deferred));
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }

    fn last_success(&self) -> Option<DateTime<Utc>> {
        self.transport.engine().last_success()
    }

    fn name(&self) -> String {
        self.transport.name(self.family.as_ref())
    }

    fn serial(&self) -> Option<&str> {
        self.transport.serial()
    }

    fn type_string(&self) -> &str {
        self.family.type_string()
    }
}

impl<T: Transport> Drop for PixelDevice<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}: close during drop failed: {}", self.name(), e);
        }
    }
}
