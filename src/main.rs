/*
 *  main.rs
 *
 *  ledwire - pixels on the wire
 *	(c) 2020-26 Stuart Hunter
 *
 *	Runner: binds a device fleet to its configuration and streams frames
 *
 *	This program is free software: you can redistribute it and/or modify
 *	it under the terms of the GNU General Public License as published by
 *	the Free Software Foundation, either version 3 of the License, or
 *	(at your option) any later version.
 *
 *	This program is distributed in the hope that it will be useful,
 *	but WITHOUT ANY WARRANTY; without even the implied warranty of
 *	MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *	GNU General Public License for more details.
 *
 *	See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *	Public License.
 *
 */

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context};
use chrono::Utc;
use env_logger::Env;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use ledwire::config::{self, Config};
use ledwire::device::drivers::sim::{SimBridge, SimUsbHandle};
use ledwire::device::{
    BoxedDevice, ColorLut, ConfigMatcher, DeviceFactory, DeviceStatus, HandleArena,
    HandleId, SpiBridge, TransferConfig,
};
use ledwire::opc::{Message, ProtocolFrame};
use ledwire::pacer::AutoPacer;
use ledwire::BufferPolicy;

include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

/// Pixels in the generated test pattern; devices take what their map asks for
const PATTERN_PIXELS: usize = 512;
const STALL_SECS: i64 = 2;
const STATS_EVERY: u64 = 300;

/// Raw handles the runner owns on behalf of the fleet
struct Handles {
    usb: HandleArena<SimUsbHandle>,
    bridges: HandleArena<dyn SpiBridge>,
}

fn main() -> anyhow::Result<()> {
    let cfg = config::load().context("loading configuration")?;

    env_logger::Builder::from_env(Env::default().default_filter_or(cfg.log_level.as_deref().unwrap_or("info")))
        .format_timestamp_secs()
        .init();

    info!("{} - pixels on the wire", env!("CARGO_PKG_NAME"));
    info!("v.{} built {}", env!("CARGO_PKG_VERSION"), BUILD_DATE);

    let policy = cfg.buffer_policy()?;
    let transfer = cfg.transfer_config();
    let tree = cfg.device_tree();
    info!("buffer policy {}, {} transfer buffer(s) per device", policy, transfer.buffers);

    let mut handles = Handles { usb: HandleArena::new(), bridges: HandleArena::new() };
    let mut fleet = build_fleet(&tree, &mut handles, policy, &transfer)?;
    if fleet.is_empty() {
        warn!("no devices to drive");
    }

    open_and_probe(&mut fleet);
    let bindings = ConfigMatcher::bind(&mut fleet, &tree);
    let bound = bindings.iter().filter(|b| b.result.is_ok()).count();
    info!("{} of {} device(s) configured", bound, fleet.len());
    apply_color_correction(&mut fleet);

    stream(&cfg, &mut fleet)?;

    let mut fatal = None;
    for device in fleet.iter_mut() {
        if let Err(e) = device.close() {
            error!("{}: close failed: {}", device.name(), e);
            if e.is_fatal() {
                fatal = Some(e);
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&status_document(&fleet))?);

    drop(fleet);
    for id in handles.bridges.ids() {
        if let Err(e) = handles.bridges.close(id) {
            warn!("bridge {}: {}", id, e);
        }
    }
    if let Some(e) = fatal {
        bail!(e);
    }
    Ok(())
}

/// One simulated device per USB record, one per port of each bridge record
fn build_fleet(
    tree: &Value,
    handles: &mut Handles,
    policy: BufferPolicy,
    transfer: &TransferConfig,
) -> anyhow::Result<Vec<BoxedDevice>> {
    let mut fleet: Vec<BoxedDevice> = Vec::new();

    for (index, record) in ConfigMatcher::records(tree).iter().enumerate() {
        let Some(kind) = record.get("type").and_then(Value::as_str) else {
            warn!("record {} has no type; skipped", index);
            continue;
        };
        match record.get("ports").and_then(Value::as_object) {
            None => {
                let serial = record
                    .get("serial")
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("SIM{:04}", index), str::to_string);
                let id = handles.usb.insert(SimUsbHandle::fadecandy(&serial));
                let handle = handles.usb.take(id)?;
                match DeviceFactory::create_usb(kind, Box::new(handle), policy, transfer.clone()) {
                    Ok(device) => fleet.push(device),
                    Err(e) => warn!("record {}: {}", index, e),
                }
            }
            Some(ports) => {
                let mut numbers: Vec<u32> = ports.keys().filter_map(|k| k.parse().ok()).collect();
                numbers.sort_unstable();
                let port_count = numbers.last().map_or(0, |p| p + 1);
                let serial = record.get("serial").and_then(Value::as_str);
                let id = handles
                    .bridges
                    .insert_shared(Arc::new(Mutex::new(SimBridge::new(serial, port_count))));
                for port in numbers {
                    let bridge = handles.bridges.get(id)?;
                    match DeviceFactory::create_spi(kind, bridge, port, policy, transfer.clone()) {
                        Ok(device) => fleet.push(device),
                        Err(e) => warn!("record {} port {}: {}", index, port, e),
                    }
                }
                log_bridge_users(&handles.bridges, id);
            }
        }
    }

    #[cfg(feature = "usb-nusb")]
    {
        use ledwire::device::drivers::fadecandy::{PRODUCT_ID, VENDOR_ID};
        use ledwire::device::drivers::nusb_handle::list_handles;
        match list_handles(VENDOR_ID, PRODUCT_ID) {
            Ok(found) => {
                for handle in found {
                    fleet.push(DeviceFactory::create_usb("fadecandy", Box::new(handle), policy, transfer.clone())?);
                }
            }
            Err(e) => warn!("USB scan failed: {}", e),
        }
    }

    Ok(fleet)
}

fn log_bridge_users(bridges: &HandleArena<dyn SpiBridge>, id: HandleId) {
    if let Ok(users) = bridges.users(id) {
        debug!("bridge {} shared by {} device(s)", id, users);
    }
}

/// Devices that fail probe are closed and dropped; open failures stay (dead)
fn open_and_probe(fleet: &mut Vec<BoxedDevice>) {
    fleet.retain_mut(|device| {
        if device.open().is_err() {
            return true;
        }
        if device.probe_after_opening() {
            return true;
        }
        warn!("{}: probe failed, discarding", device.name());
        if let Err(e) = device.close() {
            warn!("{}: close after failed probe: {}", device.name(), e);
        }
        false
    });
}

/// Gamma/whitepoint curves from each device's own settings
fn apply_color_correction(fleet: &mut [BoxedDevice]) {
    for device in fleet.iter_mut().filter(|d| d.status() == DeviceStatus::Ready) {
        let mut doc = Map::new();
        device.describe(&mut doc);
        let gamma = doc.get("gamma").and_then(Value::as_f64).unwrap_or(1.0);
        let whitepoint: [f64; 3] = doc
            .get("whitepoint")
            .and_then(|w| serde_json::from_value(w.clone()).ok())
            .unwrap_or([1.0, 1.0, 1.0]);
        if gamma == 1.0 && whitepoint == [1.0, 1.0, 1.0] {
            continue;
        }
        match gamma_lut(gamma, whitepoint) {
            Ok(lut) => {
                if let Err(e) = device.write_color_correction(lut) {
                    warn!("{}: color correction not applied: {}", device.name(), e);
                }
            }
            Err(e) => warn!("{}: {}", device.name(), e),
        }
    }
}

fn gamma_lut(gamma: f64, whitepoint: [f64; 3]) -> Result<ColorLut, ledwire::DeviceError> {
    let table = |scale: f64| -> Vec<u16> {
        (0..ledwire::device::color::LUT_ENTRIES)
            .map(|i| {
                let x = i as f64 / (ledwire::device::color::LUT_ENTRIES - 1) as f64;
                (x.powf(gamma) * scale.clamp(0.0, 1.0) * 65535.0).round() as u16
            })
            .collect()
    };
    ColorLut::from_tables(table(whitepoint[0]), table(whitepoint[1]), table(whitepoint[2]))
}

/// Rotating color wheel across the whole pattern
fn test_pattern(frame: u64) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(PATTERN_PIXELS * 3);
    for pixel in 0..PATTERN_PIXELS {
        let pos = ((pixel as u64 * 7 + frame * 3) % 256) as u8;
        let (r, g, b) = match pos {
            0..=84 => (255 - pos * 3, pos * 3, 0),
            85..=169 => (0, 255 - (pos - 85) * 3, (pos - 85) * 3),
            _ => ((pos - 170) * 3, 0, 255 - (pos - 170) * 3),
        };
        rgb.extend_from_slice(&[r, g, b]);
    }
    rgb
}

fn stream(cfg: &Config, fleet: &mut [BoxedDevice]) -> anyhow::Result<()> {
    let fps = cfg.fps();
    let frames = cfg.frames.unwrap_or(0);
    let mut pacer = AutoPacer::new(fps, fps, (fps / 4).max(1));
    info!("streaming {} frame(s) at {} fps", if frames == 0 { "unlimited".to_string() } else { frames.to_string() }, fps);

    let mut frame = 0u64;
    while frames == 0 || frame < frames {
        if fleet.iter().all(|d| matches!(d.status(), DeviceStatus::Dead | DeviceStatus::Closed)) {
            warn!("no live devices left");
            break;
        }
        pacer.wait();
        let started = Instant::now();

        // replay through the wire format, as a network client would send it
        let wire = ProtocolFrame::pixels(0, test_pattern(frame)).to_wire();
        let Some((parsed, _)) = ProtocolFrame::parse(&wire) else {
            bail!("test pattern does not frame");
        };
        let msg = Message::from(parsed);

        for device in fleet.iter_mut() {
            if let Err(e) = device.poll_events() {
                debug!("{}: {}", device.name(), e);
            }
            device.write_message(&msg);
            if let Err(e) = device.flush() {
                if e.is_fatal() {
                    return Err(e).with_context(|| format!("flushing {}", device.name()));
                }
                debug!("{}: {}", device.name(), e);
            }
        }
        pacer.record_flush_ms(started.elapsed().as_secs_f32() * 1000.0);

        frame += 1;
        if frame % STATS_EVERY == 0 {
            report_stalls(fleet);
            info!("frame {} ({} fps)", frame, pacer.fps());
        }
    }
    info!("streamed {} frame(s)", frame);
    Ok(())
}

fn report_stalls(fleet: &[BoxedDevice]) {
    let now = Utc::now();
    for device in fleet.iter().filter(|d| d.status() == DeviceStatus::Ready) {
        match device.last_success() {
            Some(t) if (now - t).num_seconds() >= STALL_SECS => {
                warn!("{}: no completed transfer for {}s", device.name(), (now - t).num_seconds());
            }
            None => warn!("{}: no transfer has completed yet", device.name()),
            _ => {}
        }
    }
}

fn status_document(fleet: &[BoxedDevice]) -> Value {
    let devices = fleet
        .iter()
        .map(|device| {
            let mut doc = Map::new();
            device.describe(&mut doc);
            Value::Object(doc)
        })
        .collect();
    Value::Array(devices)
}
