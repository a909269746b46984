/*
 *  device/matching.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Binding discovered devices to records of the configuration tree
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

use std::collections::HashSet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::error::DeviceError;
use crate::device::traits::{Device, DeviceStatus};

/// What a device is, as far as configuration matching cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdentity {
    Usb {
        type_string: &'static str,
        vendor_id: u16,
        product_id: u16,
        serial: Option<String>,
    },
    Spi {
        type_string: &'static str,
        port: u32,
    },
}

impl DeviceIdentity {
    pub fn type_string(&self) -> &'static str {
        match self {
            DeviceIdentity::Usb { type_string, .. } | DeviceIdentity::Spi { type_string, .. } => type_string,
        }
    }

    fn port(&self) -> Option<u32> {
        match self {
            DeviceIdentity::Spi { port, .. } => Some(*port),
            DeviceIdentity::Usb { .. } => None,
        }
    }
}

/// One `map` row: route `count` pixels of an OPC channel to the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry(pub u8, pub usize, pub usize, pub usize);

impl MapEntry {
    pub fn channel(&self) -> u8 {
        self.0
    }
    pub fn first_opc_pixel(&self) -> usize {
        self.1
    }
    pub fn first_output_pixel(&self) -> usize {
        self.2
    }
    pub fn count(&self) -> usize {
        self.3
    }

    /// One past the last output pixel written, `None` on overflow
    pub fn output_end(&self) -> Option<usize> {
        self.first_output_pixel().checked_add(self.count())
    }

    /// One past the last payload byte read, `None` on overflow
    pub fn source_end(&self) -> Option<usize> {
        self.first_opc_pixel().checked_add(self.count())?.checked_mul(3)
    }
}

/// Type-specific parameters of a matched record. Every field is optional;
/// the hardware family supplies defaults for whatever is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    pub pixel_count: Option<usize>,
    pub map: Option<Vec<MapEntry>>,
    pub gamma: Option<f64>,
    pub whitepoint: Option<[f64; 3]>,
    pub dither: Option<bool>,
    pub interpolate: Option<bool>,
    /// `None` leaves the activity LED under firmware control
    pub led: Option<bool>,
    pub brightness: Option<u8>,
}

impl DeviceSettings {
    pub fn from_record(record: &Value) -> Result<Self, DeviceError> {
        if !record.is_object() {
            return Err(DeviceError::MalformedConfig("device record must be an object".into()));
        }
        serde_json::from_value(record.clone()).map_err(|e| DeviceError::MalformedConfig(e.to_string()))
    }

    /// Mapping to use: the configured one, or channel 0 straight through.
    /// Every row must stay inside both the frame payload and the output.
    pub fn routed_map(&self, pixel_count: usize) -> Result<Vec<MapEntry>, DeviceError> {
        let map = match &self.map {
            Some(map) => map.clone(),
            None => vec![MapEntry(0, 0, 0, pixel_count)],
        };
        for (row, entry) in map.iter().enumerate() {
            if entry.source_end().is_none() {
                return Err(DeviceError::MalformedConfig(format!("map row {} reads past any frame", row)));
            }
            if entry.output_end().map_or(true, |end| end > pixel_count) {
                return Err(DeviceError::MalformedConfig(format!(
                    "map row {} writes past pixel {}",
                    row, pixel_count
                )));
            }
        }
        Ok(map)
    }
}

/// Pure lookup and apply logic over the externally owned configuration tree
pub struct ConfigMatcher;

impl ConfigMatcher {
    /// Device records: the tree itself if it is an array, else its `devices` array
    pub fn records(tree: &Value) -> &[Value] {
        match tree {
            Value::Array(records) => records,
            Value::Object(obj) => obj.get("devices").and_then(Value::as_array).map_or(&[], Vec::as_slice),
            _ => &[],
        }
    }

    /// Per-port record of a bridge entry (`ports` keyed by decimal port number)
    pub fn find_port_record(entry: &Value, port: u32) -> Option<&Value> {
        entry.get("ports")?.as_object()?.get(&port.to_string())
    }

    /// Whether `entry`'s identity key names this device
    pub fn entry_matches(entry: &Value, identity: &DeviceIdentity) -> bool {
        let Some(obj) = entry.as_object() else { return false };

        match obj.get("type") {
            None => {}
            Some(Value::String(t)) if t == identity.type_string() => {}
            Some(_) => return false,
        }

        match identity {
            DeviceIdentity::Usb { vendor_id, product_id, serial, .. } => {
                if obj.contains_key("ports") {
                    return false;
                }
                let keyed = obj.contains_key("type") || obj.contains_key("vendor");
                keyed
                    && Self::field_is(obj, "vendor", |v| v.as_u64() == Some(*vendor_id as u64))
                    && Self::field_is(obj, "product", |v| v.as_u64() == Some(*product_id as u64))
                    && Self::field_is(obj, "serial", |v| {
                        v.as_str().is_some_and(|s| serial.as_deref() == Some(s))
                    })
            }
            DeviceIdentity::Spi { port, .. } => {
                obj.contains_key("type") && Self::find_port_record(entry, *port).is_some()
            }
        }
    }

    fn field_is(obj: &Map<String, Value>, key: &str, test: impl Fn(&Value) -> bool) -> bool {
        obj.get(key).is_none_or(test)
    }

    /// Settings for a matched entry. Bridge entries merge the port record
    /// over the entry-level defaults.
    pub fn settings_for(entry: &Value, identity: &DeviceIdentity) -> Result<DeviceSettings, DeviceError> {
        let Some(port) = identity.port() else {
            return DeviceSettings::from_record(entry);
        };
        let record = Self::find_port_record(entry, port).ok_or(DeviceError::ConfigMismatch)?;
        let Some(port_obj) = record.as_object() else {
            return Err(DeviceError::MalformedConfig(format!("port {} record must be an object", port)));
        };
        let mut merged: Map<String, Value> = entry
            .as_object()
            .map(|obj| obj.iter().filter(|(k, _)| k.as_str() != "ports").map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        merged.extend(port_obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        DeviceSettings::from_record(&Value::Object(merged))
    }

    /// First record matching `identity`, skipping `taken` record indices
    pub fn find_entry<'a>(
        tree: &'a Value,
        identity: &DeviceIdentity,
        taken: &HashSet<(usize, Option<u32>)>,
    ) -> Option<(usize, &'a Value)> {
        Self::records(tree)
            .iter()
            .enumerate()
            .filter(|(i, _)| !taken.contains(&(*i, identity.port())))
            .find(|(_, entry)| Self::entry_matches(entry, identity))
    }

    /// Bind a fleet to the tree: every record configures at most one live
    /// (probed, not dead) device, first come first served. Devices left
    /// without a record keep their hardware defaults.
    pub fn bind(devices: &mut [Box<dyn Device>], tree: &Value) -> Vec<Binding> {
        let mut taken = HashSet::new();
        let mut bindings = Vec::with_capacity(devices.len());

        for (index, device) in devices.iter_mut().enumerate() {
            match device.status() {
                DeviceStatus::Ready => {}
                status => {
                    debug!("{}: not binding a {} device", device.name(), status.as_str());
                    let err = if status == DeviceStatus::Dead { DeviceError::Dead } else { DeviceError::NotProbed };
                    bindings.push(Binding { device: index, entry: None, result: Err(err) });
                    continue;
                }
            }
            let identity = device.identity();
            let found = Self::find_entry(tree, &identity, &taken).map(|(i, e)| (i, e.clone()));
            let binding = match found {
                Some((entry, record)) => {
                    taken.insert((entry, identity.port()));
                    let result = device.load_entry(&record);
                    match &result {
                        Ok(()) => info!("{} bound to configuration entry {}", device.name(), entry),
                        Err(e) => warn!("{}: entry {} not applied: {}", device.name(), entry, e),
                    }
                    Binding { device: index, entry: Some(entry), result }
                }
                None => {
                    if Self::records(tree).iter().any(|e| Self::entry_matches(e, &identity)) {
                        warn!("{}: matching entry already bound to another device", device.name());
                    } else {
                        warn!("{}: no configuration entry matches", device.name());
                    }
                    device.mark_unconfigured();
                    Binding { device: index, entry: None, result: Err(DeviceError::ConfigMismatch) }
                }
            };
            bindings.push(binding);
        }
        bindings
    }
}

/// Outcome of binding one device
#[derive(Debug)]
pub struct Binding {
    pub device: usize,
    pub entry: Option<usize>,
    pub result: Result<(), DeviceError>,
}
