//! Integration tests for device lifecycle through a context.
//!
//! Covers resource sharing between devices, idempotent stop, the standard
//! error path for start, read, and write failures, lazy restart, and
//! configuration changes.

mod common;

use std::sync::Arc;

use common::{Harness, adc, id, relay};
use pinboard_core::constants::{TRIGGER_DEVICE_ERROR, TRIGGER_LIMIT_FAULT};
use pinboard_core::{ErrorKind, HandleKey, ResourceId};
use pinboard_devices::config::{DeviceConfig, DeviceFile, DeviceKind, Direction, GpioConfig};
use pinboard_devices::{EventName, Lifecycle, TriggerFilter};

fn relay_board() -> HandleKey {
    HandleKey::I2c {
        bus: 1,
        address: common::RELAY_ADDRESS,
    }
}

fn connection() -> ResourceId {
    ResourceId::connection("localhost", pinboard_core::constants::DEFAULT_DAEMON_PORT)
}

// ============================================================================
// Resource Sharing
// ============================================================================

#[test]
fn test_devices_share_connection_and_handle() {
    let h = Harness::new();
    let pumps: Vec<_> = (1..=3)
        .map(|channel| h.start(relay(&format!("pump-{channel}"), channel)))
        .collect();

    assert_eq!(h.daemon.connections_opened(), 1);
    assert_eq!(h.daemon.open_count(relay_board()), 1);
    assert_eq!(h.ctx.pool().use_count(&connection()), 3);
    assert_eq!(h.ctx.pool().use_count(&connection().handle(relay_board())), 3);

    pumps[0].stop();
    assert_eq!(h.daemon.close_count(relay_board()), 0);
    assert_eq!(h.ctx.pool().use_count(&connection()), 2);

    for pump in &pumps[1..] {
        pump.stop();
    }
    assert_eq!(h.daemon.close_count(relay_board()), 1);
    assert_eq!(h.daemon.connections_closed(), 1);
    assert_eq!(h.daemon.open_handles(), 0);
    assert!(h.ctx.pool().is_empty());
}

#[test]
fn test_stop_is_idempotent() {
    let h = Harness::new();
    let pump = h.start(relay("pump", 1));

    pump.stop();
    pump.stop();

    assert_eq!(pump.lifecycle(), Lifecycle::Stopped);
    assert_eq!(h.daemon.close_count(relay_board()), 1);
    assert_eq!(h.daemon.connections_closed(), 1);
    assert!(h.ctx.get(&id("pump")).is_none());
}

#[test]
fn test_close_stops_everything_and_refuses_starts() {
    let h = Harness::new();
    h.start(relay("pump", 1));
    h.start(adc("level"));

    h.ctx.close();

    assert!(h.ctx.directory().is_empty());
    assert_eq!(h.daemon.open_handles(), 0);
    assert!(h.ctx.get_or_start(&id("pump"), true).is_none());
}

#[test]
fn test_concurrent_starts_share_one_device() {
    let h = Harness::new();
    h.ctx.configure(relay("pump", 1)).unwrap();

    let devices: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| h.ctx.get_or_start(&id("pump"), true)))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap().unwrap())
            .collect()
    });

    assert!(devices.iter().all(|device| Arc::ptr_eq(device, &devices[0])));
    assert_eq!(h.ctx.directory().len(), 1);
    assert_eq!(h.daemon.open_count(relay_board()), 1);
    assert_eq!(h.ctx.pool().use_count(&connection()), 1);
}

// ============================================================================
// Standard Error Path
// ============================================================================

#[test]
fn test_unreachable_daemon_reports_connection_error() {
    let h = Harness::new();
    let mut errors = h
        .ctx
        .triggers()
        .subscribe(TriggerFilter::any(TRIGGER_DEVICE_ERROR));
    h.daemon.set_reachable(false);
    h.ctx.configure(relay("pump", 1)).unwrap();

    assert!(h.ctx.get_or_start(&id("pump"), true).is_none());

    assert_eq!(h.reporter.errors(&id("pump")), vec![ErrorKind::Connection]);
    let event = errors.try_recv().unwrap();
    assert_eq!(event.event_name, "connectionError");
    assert!(h.ctx.pool().is_empty());
}

#[test]
fn test_failed_start_releases_partial_resources() {
    let h = Harness::new();
    h.daemon.set_gpio_fault(22, true);
    let button = DeviceConfig::new(
        id("button"),
        DeviceKind::Gpio(GpioConfig {
            gpio: 22,
            callback: true,
            ..GpioConfig::default()
        }),
    );
    h.ctx.configure(button).unwrap();

    assert!(h.ctx.get_or_start(&id("button"), true).is_none());

    assert_eq!(h.reporter.errors(&id("button")), vec![ErrorKind::Start]);
    assert_eq!(h.daemon.close_count(HandleKey::GpioChip(0)), 1);
    assert_eq!(h.daemon.connections_closed(), 1);
    assert_eq!(h.daemon.open_handles(), 0);
}

#[test]
fn test_read_failure_stops_device_until_next_use() {
    let h = Harness::new();
    let pump = h.start(relay("pump", 1));
    h.daemon.set_i2c_fault(1, common::RELAY_ADDRESS, true);

    pump.read(false);

    assert_eq!(pump.lifecycle(), Lifecycle::Stopped);
    assert_eq!(h.reporter.errors(&id("pump")), vec![ErrorKind::Read]);
    assert!(h.ctx.get(&id("pump")).is_none());
    assert!(h.ctx.get_or_start(&id("pump"), false).is_none());

    h.daemon.set_i2c_fault(1, common::RELAY_ADDRESS, false);
    let restarted = h.ctx.get_or_start(&id("pump"), true).unwrap();
    assert!(!Arc::ptr_eq(&pump, &restarted));
    assert!(restarted.is_running());
}

#[test]
fn test_write_failure_reports_write_error() {
    let h = Harness::new();
    let pump = h.start(relay("pump", 1));
    h.daemon.set_i2c_fault(1, common::RELAY_ADDRESS, true);

    pump.write(1.0);

    assert_eq!(h.reporter.errors(&id("pump")), vec![ErrorKind::Write]);
    assert!(!pump.is_running());
}

#[test]
fn test_error_triggers_are_rate_limited_across_devices() {
    let h = Harness::new();
    let mut errors = h
        .ctx
        .triggers()
        .subscribe(TriggerFilter::new(
            TRIGGER_DEVICE_ERROR,
            EventName::named("readError"),
        ));
    let pumps = [h.start(relay("pump-1", 1)), h.start(relay("pump-2", 2))];
    h.daemon.set_i2c_fault(1, common::RELAY_ADDRESS, true);

    for pump in &pumps {
        pump.read(false);
    }

    // Both devices are marked, but the shared event name fires once.
    assert_eq!(h.reporter.errors(&id("pump-1")), vec![ErrorKind::Read]);
    assert_eq!(h.reporter.errors(&id("pump-2")), vec![ErrorKind::Read]);
    assert!(errors.try_recv().is_ok());
    assert!(errors.try_recv().is_err());
    assert!(h.ctx.triggers().is_limited("readError"));
}

#[test]
fn test_invalid_write_value_keeps_device_running() {
    let h = Harness::new();
    let pump = h.start(relay("pump", 1));

    pump.write(0.5);

    assert!(pump.is_running());
    assert!(h.reporter.errors(&id("pump")).is_empty());
    assert!(h.daemon.i2c_writes(1, common::RELAY_ADDRESS).is_empty());
}

#[test]
fn test_write_to_input_is_ignored() {
    let h = Harness::new();
    let button = h.start(DeviceConfig::new(
        id("button"),
        DeviceKind::Gpio(GpioConfig {
            gpio: 22,
            direction: Direction::Input,
            ..GpioConfig::default()
        }),
    ));

    button.write(1.0);

    assert!(button.is_running());
    assert!(!h.daemon.gpio_is_output(22));
}

// ============================================================================
// Analog Readings
// ============================================================================

#[test]
fn test_adc_reading_reaches_reporter() {
    let h = Harness::new();
    let level = h.start(adc("level"));
    h.daemon.queue_spi_reply(0, &[0x00, 0x08, 0x00]);

    level.read(false);

    let reading = h.reporter.last_reading(&id("level")).unwrap();
    assert!((reading.scaled - 2.048).abs() < 1e-9);
    assert_eq!(reading.text, "2.05");
}

#[test]
fn test_limit_fault_fires_on_rising_edge_only() {
    let h = Harness::new();
    let mut faults = h
        .ctx
        .triggers()
        .subscribe(TriggerFilter::any(TRIGGER_LIMIT_FAULT));
    let mut config = adc("level");
    if let DeviceKind::Mcp320x(adc) = &mut config.kind {
        adc.scaling.high_limit = Some(2.0);
    }
    let level = h.start(config);

    for reply in [[0x00, 0x08, 0x00], [0x00, 0x08, 0x00]] {
        h.daemon.queue_spi_reply(0, &reply);
        level.read(false);
    }

    let event = faults.try_recv().unwrap();
    assert_eq!(event.event_name, "highLimit");
    assert!(faults.try_recv().is_err());
    assert!(h.reporter.last_reading(&id("level")).unwrap().high_fault);
}

#[test]
fn test_out_of_range_dac_value_is_ignored() {
    let h = Harness::new();
    let dac = h.start(DeviceConfig::new(
        id("setpoint"),
        DeviceKind::Mcp482x(Default::default()),
    ));

    dac.write(5.0);

    assert!(dac.is_running());
    assert!(h.daemon.spi_writes(0).is_empty());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_change_restarts_device() {
    let h = Harness::new();
    let pump = h.start(relay("pump", 1));

    // Same settings: keeps running.
    h.ctx.configure(relay("pump", 1)).unwrap();
    assert!(pump.is_running());

    h.ctx.configure(relay("pump", 2)).unwrap();
    assert!(!pump.is_running());

    let restarted = h.ctx.get_or_start(&id("pump"), true).unwrap();
    restarted.write(1.0);
    assert_eq!(h.daemon.i2c_register(1, common::RELAY_ADDRESS, 2), 0xFF);
    assert_eq!(h.daemon.i2c_register(1, common::RELAY_ADDRESS, 1), 0x00);
}

#[test]
fn test_remove_forgets_device() {
    let h = Harness::new();
    let pump = h.start(relay("pump", 1));

    assert!(h.ctx.remove(&id("pump")));
    assert!(!pump.is_running());
    assert!(h.ctx.get_or_start(&id("pump"), true).is_none());
    assert!(!h.ctx.remove(&id("pump")));
}

#[test]
fn test_unknown_device_is_not_started() {
    let h = Harness::new();
    assert!(h.ctx.get_or_start(&id("ghost"), true).is_none());
    assert_eq!(h.daemon.connections_opened(), 0);
}

#[test]
fn test_device_file_starts_all() {
    let json = r#"{
        "context": { "poll_period_secs": 0.25 },
        "devices": [
            { "id": "pump", "kind": { "type": "relay", "channel": 2 } },
            { "id": "level", "name": "Tank level",
              "kind": { "type": "mcp320x", "reference_voltage": 4.096 } },
            { "id": "door", "kind": { "type": "gpio", "gpio": 5, "callback": true } }
        ]
    }"#;
    let file = DeviceFile::from_json(json).unwrap();
    let h = Harness::new();
    h.ctx.configure_all(file.devices).unwrap();

    assert_eq!(h.ctx.start_all(), 3);
    assert_eq!(h.ctx.device_ids(), vec![id("door"), id("level"), id("pump")]);
    assert_eq!(h.ctx.get(&id("level")).unwrap().name(), "Tank level");
    assert_eq!(h.daemon.connections_opened(), 1);
}
