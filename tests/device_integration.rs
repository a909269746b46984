/*
 *  tests/device_integration.rs
 *
 *  Integration tests for the device layer against the simulated stack
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 */

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};

use ledwire::device::drivers::fadecandy::{self, FadecandyFamily};
use ledwire::device::drivers::sim::{SimBridge, SimBridgeState, SimUsbHandle, SimUsbState};
use ledwire::device::drivers::Apa102Family;
use ledwire::device::{
    BoxedDevice, BufferPolicy, BufferState, ColorLut, ConfigMatcher, Device, DeviceDescriptor,
    DeviceError, DeviceStatus, HandleArena, SharedBridge, SpiBridge, SpiDevice, Transport,
    TransferConfig, UsbDevice, WriteAck,
};
use ledwire::opc::{Message, ProtocolFrame, CMD_SYSTEM_EXCLUSIVE};

const POLICIES: [BufferPolicy; 2] = [BufferPolicy::CopyOnSubmit, BufferPolicy::NoCopyNeeded];

fn lock<T>(state: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    state.lock().unwrap()
}

fn fadecandy_with(serial: &str, policy: BufferPolicy, config: TransferConfig) -> (UsbDevice, Arc<Mutex<SimUsbState>>) {
    let handle = SimUsbHandle::fadecandy(serial);
    let state = handle.state();
    let device = UsbDevice::new(Box::new(handle), Box::new(FadecandyFamily::new()), policy, config);
    (device, state)
}

fn fadecandy(serial: &str, policy: BufferPolicy) -> (UsbDevice, Arc<Mutex<SimUsbState>>) {
    fadecandy_with(serial, policy, TransferConfig::default())
}

/// Opened and probed, with transfers completing only when the test says so
fn ready_fadecandy(serial: &str, policy: BufferPolicy) -> (UsbDevice, Arc<Mutex<SimUsbState>>) {
    let (mut device, state) = fadecandy(serial, policy);
    lock(&state).auto_complete = false;
    device.open().unwrap();
    assert!(device.probe_after_opening());
    (device, state)
}

fn solid(r: u8, g: u8, b: u8) -> Message {
    ProtocolFrame::pixels(0, [r, g, b].repeat(4)).into()
}

fn describe(device: &dyn Device) -> Map<String, Value> {
    let mut doc = Map::new();
    device.describe(&mut doc);
    doc
}

/// First pixel of each framebuffer transfer that reached the wire
fn first_pixels(state: &Arc<Mutex<SimUsbState>>) -> Vec<[u8; 3]> {
    lock(state)
        .queue
        .wire_for(1)
        .iter()
        .filter(|t| t.len() == 1600 && t[0] == 0x00)
        .map(|t| [t[1], t[2], t[3]])
        .collect()
}

#[test]
fn test_open_probe_and_name() {
    let (mut device, _state) = fadecandy("FC100", BufferPolicy::for_host());
    assert_eq!(device.status(), DeviceStatus::Closed);
    device.open().unwrap();
    assert_eq!(device.status(), DeviceStatus::Open);
    assert!(device.probe_after_opening());
    assert_eq!(device.status(), DeviceStatus::Ready);

    assert_eq!(device.name(), "Fadecandy (Serial# FC100, Version 1.07)");
    assert_eq!(device.serial(), Some("FC100"));
    assert_eq!(device.type_string(), "fadecandy");
    assert_eq!(device.firmware_version().as_deref(), Some("1.07"));
}

#[test]
fn test_probe_rejects_foreign_hardware() {
    let descriptor = DeviceDescriptor { vendor_id: 0x0403, product_id: 0x6001, bcd_device: 0x0600 };
    let handle = SimUsbHandle::new(descriptor, Some("FTDI1"));
    let mut device = UsbDevice::new(
        Box::new(handle),
        Box::new(FadecandyFamily::new()),
        BufferPolicy::CopyOnSubmit,
        TransferConfig::default(),
    );
    device.open().unwrap();
    assert!(!device.probe_after_opening());
    assert_eq!(device.status(), DeviceStatus::Open);
    device.close().unwrap();
}

#[test]
fn test_open_failure_leaves_device_dead_but_visible() {
    let (mut device, state) = fadecandy("FC101", BufferPolicy::CopyOnSubmit);
    lock(&state).fail_claim = true;

    assert!(matches!(device.open(), Err(DeviceError::OpenFailure(_))));
    assert_eq!(device.status(), DeviceStatus::Dead);
    assert_eq!(device.write_message(&solid(1, 2, 3)), WriteAck::Discarded);
    assert_eq!(describe(&device)["status"], "dead");
}

#[test]
fn test_no_tearing_when_image_changes_during_flight() {
    for policy in POLICIES {
        let (mut device, state) = ready_fadecandy("FC102", policy);

        assert_eq!(device.write_message(&solid(255, 0, 0)), WriteAck::Staged);
        assert_eq!(device.write_message(&solid(0, 255, 0)), WriteAck::Staged);
        // the device image keeps changing while both transfers are queued
        device.write_message(&solid(0, 0, 255));
        device.write_message(&solid(9, 9, 9));

        {
            let sim = lock(&state);
            let in_flight: Vec<[u8; 3]> = sim.queue.pending.iter().map(|t| [t.data[1], t.data[2], t.data[3]]).collect();
            assert_eq!(in_flight, vec![[255, 0, 0], [0, 255, 0]], "{}", policy);
        }

        lock(&state).queue.complete_all();
        device.flush().unwrap();
        lock(&state).queue.complete_all();
        device.flush().unwrap();

        let wire = first_pixels(&state);
        assert_eq!(&wire[..2], &[[255, 0, 0], [0, 255, 0]], "{}", policy);
        assert_eq!(wire.last(), Some(&[9, 9, 9]), "{}", policy);
    }
}

#[test]
fn test_nocopy_holds_buffers_until_flush() {
    let (mut device, state) = ready_fadecandy("FC103", BufferPolicy::NoCopyNeeded);

    device.write_message(&solid(1, 1, 1));
    device.write_message(&solid(2, 2, 2));
    let engine = device.transport().engine();
    assert_eq!(engine.buffer_states(), vec![BufferState::InFlight, BufferState::InFlight]);

    // no free buffer: the write is coalesced, not torn into an in-flight one
    assert_eq!(device.write_message(&solid(3, 3, 3)), WriteAck::Deferred);
    assert_eq!(device.write_message(&solid(4, 4, 4)), WriteAck::Deferred);
    assert_eq!(device.backlog_len(), 1);

    lock(&state).queue.complete_next();
    device.poll_events().unwrap();
    assert_eq!(device.transport().engine().buffer_states()[0], BufferState::Completed);

    device.flush().unwrap();
    assert_eq!(device.backlog_len(), 0);
    assert_eq!(device.transport().engine().buffer_states()[0], BufferState::InFlight);
    assert_eq!(lock(&state).queue.pending.back().map(|t| t.data[1]), Some(4));
}

#[test]
fn test_copy_policy_frees_buffer_at_submit() {
    let (mut device, _state) = ready_fadecandy("FC104", BufferPolicy::CopyOnSubmit);
    device.write_message(&solid(1, 1, 1));
    let engine = device.transport().engine();
    assert_eq!(engine.buffer_states(), vec![BufferState::Free, BufferState::Free]);
    assert_eq!(engine.in_flight(), 1);
}

#[test]
fn test_per_device_write_order() {
    for policy in POLICIES {
        let (mut device, state) = fadecandy("FC105", policy);
        device.open().unwrap();
        assert!(device.probe_after_opening());

        for shade in 1..=6u8 {
            device.poll_events().unwrap();
            device.write_message(&solid(shade, 0, 0));
            device.flush().unwrap();
        }
        device.poll_events().unwrap();
        device.flush().unwrap();
        device.poll_events().unwrap();

        let shades: Vec<u8> = first_pixels(&state).iter().map(|p| p[0]).collect();
        assert!(shades.windows(2).all(|w| w[0] < w[1]), "{} reordered: {:?}", policy, shades);
        assert_eq!(shades.last(), Some(&6));
    }
}

#[test]
fn test_frames_and_control_packets_keep_write_order_under_backpressure() {
    for policy in POLICIES {
        let (mut device, state) = ready_fadecandy("FC119", policy);

        for shade in 1..=3u8 {
            assert_ne!(device.write_message(&solid(shade, 0, 0)), WriteAck::Discarded);
        }
        device.write_color_correction(ColorLut::identity()).unwrap();
        device.write_message(&solid(5, 0, 0));
        device.write_message(&solid(6, 0, 0));

        for _ in 0..6 {
            lock(&state).queue.complete_all();
            device.flush().unwrap();
        }
        lock(&state).queue.complete_all();
        assert_eq!(device.backlog_len(), 0, "{}", policy);

        // frames by their first pixel, the LUT upload as None
        let order: Vec<Option<u8>> = lock(&state)
            .queue
            .wire_for(1)
            .iter()
            .map(|t| if t[0] == fadecandy::TYPE_LUT { None } else { Some(t[1]) })
            .collect();
        assert_eq!(order, vec![Some(1), Some(2), Some(3), None, Some(6)], "{}", policy);
    }
}

#[test]
fn test_configuration_round_trip_replaces_settings() {
    let (mut device, _state) = fadecandy("FC106", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());

    let first = json!([{"type": "fadecandy", "serial": "FC106", "pixelCount": 64, "dither": false}]);
    device.load_configuration(&first).unwrap();
    let doc = describe(&device);
    assert_eq!(doc["pixelCount"], 64);
    assert_eq!(doc["dither"], false);
    assert_eq!(doc["config"], "configured");

    let second = json!({"devices": [{"type": "fadecandy", "pixelCount": 128, "gamma": 2.2}]});
    device.load_configuration(&second).unwrap();
    let doc = describe(&device);
    assert_eq!(doc["pixelCount"], 128);
    assert_eq!(doc["gamma"], 2.2);
    // absent keys fall back to defaults, nothing carries over
    assert_eq!(doc["dither"], true);
    assert_eq!(doc["map"], json!([[0, 0, 0, 128]]));
}

#[test]
fn test_match_configuration_is_pure() {
    let (mut device, _state) = fadecandy("FC107", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());
    let before = describe(&device);

    let mine = json!([{"type": "fadecandy", "serial": "FC107", "pixelCount": 10}]);
    let theirs = json!([{"type": "fadecandy", "serial": "OTHER"}, {"type": "apa102spi", "ports": {"0": {}}}]);
    assert!(device.match_configuration(&mine));
    assert!(!device.match_configuration(&theirs));
    assert_eq!(describe(&device), before);
}

#[test]
fn test_load_before_probe_is_refused() {
    let (mut device, _state) = fadecandy("FC108", BufferPolicy::CopyOnSubmit);
    let tree = json!([{"type": "fadecandy"}]);
    assert!(matches!(device.load_configuration(&tree), Err(DeviceError::NotProbed)));
    device.open().unwrap();
    assert!(matches!(device.load_configuration(&tree), Err(DeviceError::NotProbed)));
    assert!(device.probe_after_opening());
    device.load_configuration(&tree).unwrap();
}

#[test]
fn test_mismatch_keeps_defaults_and_keeps_running() {
    let (mut device, state) = fadecandy("FC109", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());

    let tree = json!([{"type": "fadecandy", "serial": "NOT-ME", "pixelCount": 8}]);
    assert!(matches!(device.load_configuration(&tree), Err(DeviceError::ConfigMismatch)));
    let doc = describe(&device);
    assert_eq!(doc["config"], "unconfigured");
    assert_eq!(doc["pixelCount"], fadecandy::MAX_PIXELS);
    assert_eq!(doc["status"], "ready");

    assert_eq!(device.write_message(&solid(5, 5, 5)), WriteAck::Staged);
    device.poll_events().unwrap();
    assert_eq!(first_pixels(&state).last(), Some(&[5, 5, 5]));
}

#[test]
fn test_malformed_record_is_reported() {
    let (mut device, _state) = fadecandy("FC110", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());

    let tree = json!([{"type": "fadecandy", "pixelCount": "lots"}]);
    assert!(matches!(device.load_configuration(&tree), Err(DeviceError::MalformedConfig(_))));
    let doc = describe(&device);
    assert_eq!(doc["config"], "rejected");
    assert!(doc.contains_key("configError"));
}

#[test]
fn test_rejected_reload_falls_back_to_defaults() {
    let (mut device, _state) = fadecandy("FC116", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());

    device.load_configuration(&json!([{"type": "fadecandy", "pixelCount": 64}])).unwrap();
    assert_eq!(describe(&device)["pixelCount"], 64);

    let tree = json!([{"type": "fadecandy", "pixelCount": "lots"}]);
    assert!(matches!(device.load_configuration(&tree), Err(DeviceError::MalformedConfig(_))));
    let doc = describe(&device);
    assert_eq!(doc["config"], "rejected");
    assert_eq!(doc["pixelCount"], 512);
}

#[test]
fn test_overflowing_map_rows_are_malformed() {
    let (mut device, state) = fadecandy("FC117", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());

    for row in [json!([0, 0, 1, u64::MAX]), json!([0, 6148914691236517376u64, 0, 1])] {
        let tree = json!([{"type": "fadecandy", "pixelCount": 64, "map": [row]}]);
        assert!(matches!(device.load_configuration(&tree), Err(DeviceError::MalformedConfig(_))), "{}", row);
        assert_eq!(describe(&device)["config"], "rejected");

        // frames still render through the default layout
        assert_eq!(device.write_message(&solid(7, 7, 7)), WriteAck::Staged);
        device.poll_events().unwrap();
    }
    assert_eq!(first_pixels(&state).last(), Some(&[7, 7, 7]));
}

#[test]
fn test_dead_device_stays_dead_after_close() {
    let (mut device, state) = fadecandy("FC118", BufferPolicy::NoCopyNeeded);
    device.open().unwrap();
    assert!(device.probe_after_opening());
    lock(&state).reject_submits = true;

    device.write_message(&solid(1, 1, 1));
    for _ in 0..5 {
        let _ = device.flush();
    }
    assert_eq!(device.status(), DeviceStatus::Dead);

    device.close().unwrap();
    assert_eq!(device.status(), DeviceStatus::Dead);
    assert_eq!(describe(&device)["status"], "dead");
    assert!(!lock(&state).claimed);

    lock(&state).reject_submits = false;
    assert!(device.open().is_err());
    assert_eq!(device.status(), DeviceStatus::Dead);
    assert!(!lock(&state).claimed);
}

#[test]
fn test_fleet_isolates_faulty_device() {
    let mut states = Vec::new();
    let mut fleet: Vec<BoxedDevice> = Vec::new();
    for serial in ["FC-A", "FC-B", "FC-C"] {
        let (device, state) = fadecandy(serial, BufferPolicy::NoCopyNeeded);
        fleet.push(Box::new(device));
        states.push(state);
    }
    lock(&states[1]).reject_submits = true;

    for device in fleet.iter_mut() {
        device.open().unwrap();
        assert!(device.probe_after_opening());
    }
    let tree = json!([{"type": "fadecandy"}, {"type": "fadecandy"}, {"type": "fadecandy"}]);
    let bindings = ConfigMatcher::bind(&mut fleet, &tree);
    assert!(bindings.iter().all(|b| b.entry.is_some()));

    for shade in 1..=5u8 {
        for device in fleet.iter_mut() {
            let _ = device.poll_events();
            device.write_message(&solid(shade, shade, shade));
            let flushed = device.flush();
            assert!(flushed.as_ref().map_or_else(|e| !e.is_fatal(), |_| true));
        }
    }
    for device in fleet.iter_mut() {
        let _ = device.poll_events();
    }

    assert_eq!(fleet[1].status(), DeviceStatus::Dead);
    assert_eq!(fleet[1].write_message(&solid(1, 1, 1)), WriteAck::Discarded);
    assert!(fleet[1].flush().is_ok());
    for healthy in [0, 2] {
        assert_eq!(fleet[healthy].status(), DeviceStatus::Ready);
        assert_eq!(first_pixels(&states[healthy]).len(), 5);
        assert!(fleet[healthy].last_success().is_some());
    }
    let statuses: Vec<Value> = fleet.iter().map(|d| describe(&**d)["status"].clone()).collect();
    assert_eq!(statuses, vec![json!("ready"), json!("dead"), json!("ready")]);
}

#[test]
fn test_bind_is_first_come_first_served() {
    let (mut a, _sa) = fadecandy("FC-1", BufferPolicy::CopyOnSubmit);
    let (mut b, _sb) = fadecandy("FC-2", BufferPolicy::CopyOnSubmit);
    for device in [&mut a, &mut b] {
        device.open().unwrap();
        assert!(device.probe_after_opening());
    }
    let mut fleet: Vec<BoxedDevice> = vec![Box::new(a), Box::new(b)];
    let tree = json!([{"type": "fadecandy", "pixelCount": 32}]);
    let bindings = ConfigMatcher::bind(&mut fleet, &tree);

    assert_eq!(bindings[0].entry, Some(0));
    assert!(bindings[0].result.is_ok());
    assert_eq!(bindings[1].entry, None);
    assert!(matches!(bindings[1].result, Err(DeviceError::ConfigMismatch)));
    assert_eq!(describe(&*fleet[1])["config"], "unconfigured");
}

#[test]
fn test_close_cancels_in_flight_transfers() {
    let (mut device, state) = ready_fadecandy("FC111", BufferPolicy::NoCopyNeeded);
    device.write_message(&solid(1, 1, 1));
    device.write_message(&solid(2, 2, 2));
    assert_eq!(lock(&state).queue.pending.len(), 2);

    device.close().unwrap();
    assert_eq!(device.status(), DeviceStatus::Closed);
    let sim = lock(&state);
    assert!(sim.queue.pending.is_empty());
    assert!(sim.queue.wire.is_empty());
    assert!(!sim.claimed);
    drop(sim);
    assert_eq!(describe(&device)["transfers"]["cancelled"], 2);
    assert!(matches!(device.flush(), Err(DeviceError::NotOpen)));
}

#[test]
fn test_unconfirmed_cancel_is_fatal() {
    let config = TransferConfig { cancel_timeout: Duration::from_millis(30), ..Default::default() };
    let (mut device, state) = fadecandy_with("FC112", BufferPolicy::NoCopyNeeded, config);
    device.open().unwrap();
    assert!(device.probe_after_opening());
    {
        let mut sim = lock(&state);
        sim.auto_complete = false;
        sim.ignore_cancel = true;
    }
    device.write_message(&solid(1, 1, 1));

    let err = device.close().unwrap_err();
    assert!(matches!(err, DeviceError::CancelFailed(_)));
    assert!(err.is_fatal());

    // let the stack finish so drop can close cleanly
    lock(&state).ignore_cancel = false;
    lock(&state).queue.complete_all();
    device.close().unwrap();
}

#[test]
fn test_color_correction_uploads_lut() {
    let (mut device, state) = fadecandy("FC113", BufferPolicy::CopyOnSubmit);
    assert!(matches!(device.write_color_correction(ColorLut::identity()), Err(DeviceError::NotOpen)));

    device.open().unwrap();
    assert!(device.probe_after_opening());
    let lut = ColorLut::from_json(&json!({"r": [0, 65535], "g": [0, 32768], "b": [0, 0]})).unwrap();
    device.write_color_correction(lut).unwrap();
    device.poll_events().unwrap();

    let wire = lock(&state).queue.wire_for(1);
    let upload = wire.iter().find(|t| t[0] & 0xC0 == fadecandy::TYPE_LUT).unwrap();
    assert_eq!(upload.len(), 1600);
    // last red entry is full scale
    let at = 8 * 64 + 2 + 8 * 2;
    assert_eq!(u16::from_le_bytes([upload[at], upload[at + 1]]), 65535);
}

#[test]
fn test_sysex_routes_device_options() {
    let (mut device, state) = fadecandy("FC114", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());

    let payload = serde_json::to_vec(&json!({"type": "device_options", "led": true})).unwrap();
    let sysex = Message::from(ProtocolFrame::new(0, CMD_SYSTEM_EXCLUSIVE, payload));
    assert_eq!(device.write_message(&sysex), WriteAck::Staged);
    device.poll_events().unwrap();
    let wire = lock(&state).queue.wire_for(1);
    assert_eq!(wire.last().map(|p| (p.len(), p[0], p[1])), Some((64, fadecandy::TYPE_CONFIG, 0x0C)));

    let binary = Message::from(ProtocolFrame::new(0, CMD_SYSTEM_EXCLUSIVE, vec![0, 1, 2]));
    assert_eq!(device.write_message(&binary), WriteAck::Acknowledged);
    let unknown = Message::from(ProtocolFrame::new(0, 0x42, vec![1, 2, 3]));
    assert_eq!(device.write_message(&unknown), WriteAck::Acknowledged);
    let other_channel = Message::from(ProtocolFrame::pixels(7, vec![1, 2, 3]));
    assert_eq!(device.write_message(&other_channel), WriteAck::Acknowledged);
}

fn shared_bridge(ports: u32) -> (SharedBridge, Arc<Mutex<SimBridgeState>>) {
    let bridge = SimBridge::new(Some("BR-7"), ports);
    let state = bridge.state();
    let shared: SharedBridge = Arc::new(Mutex::new(bridge));
    (shared, state)
}

fn apa102(bridge: &SharedBridge, port: u32) -> SpiDevice {
    SpiDevice::new(
        Arc::clone(bridge),
        port,
        Box::new(Apa102Family::new()),
        BufferPolicy::for_host(),
        TransferConfig::default(),
    )
}

#[test]
fn test_spi_ports_share_one_bridge() {
    let (bridge, state) = shared_bridge(4);
    let mut fleet: Vec<BoxedDevice> = vec![Box::new(apa102(&bridge, 0)), Box::new(apa102(&bridge, 2))];
    for device in fleet.iter_mut() {
        device.open().unwrap();
        assert!(device.probe_after_opening());
    }
    let tree = json!([{
        "type": "apa102spi",
        "serial": "BR-7",
        "ports": {"0": {"pixelCount": 2}, "2": {"pixelCount": 3, "brightness": 8}}
    }]);
    let bindings = ConfigMatcher::bind(&mut fleet, &tree);
    assert!(bindings.iter().all(|b| b.result.is_ok()));

    let frame = Message::from(ProtocolFrame::pixels(0, vec![255, 0, 0, 0, 0, 255, 0, 255, 0]));
    for device in fleet.iter_mut() {
        // synchronous: the bridge has the bytes when this returns
        assert_eq!(device.write_message(&frame), WriteAck::Staged);
    }

    let sim = lock(&state);
    assert!(sim.queue.pending.is_empty());
    let port0 = sim.queue.wire_for(0);
    let port2 = sim.queue.wire_for(2);
    assert_eq!(port0.len(), 1);
    assert_eq!(&port0[0][4..12], &[0xFF, 0, 0, 255, 0xFF, 255, 0, 0]);
    assert_eq!(port0[0].len(), 4 + 8 + 4);
    assert_eq!(&port2[0][4..8], &[0xE8, 0, 0, 255]);
    assert_eq!(port2[0].len(), 4 + 12 + 4);
    drop(sim);

    let doc = describe(&*fleet[1]);
    assert_eq!(doc["port"], 2);
    assert_eq!(doc["bridge"], "BR-7");
    assert_eq!(doc["pixelCount"], 3);
    assert_eq!(fleet[0].name(), "APA102 SPI (Bridge BR-7, Port 0)");
}

#[test]
fn test_spi_port_conflict_isolates_late_device() {
    let (bridge, state) = shared_bridge(2);
    let mut first = apa102(&bridge, 1);
    let mut second = apa102(&bridge, 1);
    first.open().unwrap();
    assert!(matches!(second.open(), Err(DeviceError::OpenFailure(_))));
    assert_eq!(second.status(), DeviceStatus::Dead);

    assert!(first.probe_after_opening());
    first.close().unwrap();
    assert!(lock(&state).bound.is_empty());
}

#[test]
fn test_spi_device_requires_port_record() {
    let (bridge, _state) = shared_bridge(4);
    let mut device = apa102(&bridge, 3);
    device.open().unwrap();
    assert!(device.probe_after_opening());
    let tree = json!([{"type": "apa102spi", "ports": {"0": {}, "1": {}}}]);
    assert!(!device.match_configuration(&tree));
    assert!(matches!(device.load_configuration(&tree), Err(DeviceError::ConfigMismatch)));
}

#[test]
fn test_bridge_outlives_its_devices() {
    let mut arena: HandleArena<dyn SpiBridge> = HandleArena::new();
    let id = arena.insert_shared(Arc::new(Mutex::new(SimBridge::new(None, 2))));

    let a = SpiDevice::new(arena.get(id).unwrap(), 0, Box::new(Apa102Family::new()), BufferPolicy::CopyOnSubmit, TransferConfig::default());
    let b = SpiDevice::new(arena.get(id).unwrap(), 1, Box::new(Apa102Family::new()), BufferPolicy::CopyOnSubmit, TransferConfig::default());
    assert_eq!(arena.users(id).unwrap(), 2);
    assert!(arena.close(id).is_err());

    drop(a);
    drop(b);
    arena.close(id).unwrap();
}

#[test]
fn test_event_failure_kills_only_that_device() {
    let (mut device, state) = fadecandy("FC115", BufferPolicy::CopyOnSubmit);
    device.open().unwrap();
    assert!(device.probe_after_opening());
    lock(&state).fail_events = true;

    let err = device.poll_events().unwrap_err();
    assert!(matches!(err, DeviceError::EventStep(_)), "{:?}", err);
    assert!(!err.to_string().contains("attempt"));
    assert_eq!(device.status(), DeviceStatus::Dead);
    assert_eq!(device.write_message(&solid(1, 1, 1)), WriteAck::Discarded);
}
