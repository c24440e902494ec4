//! Common test utilities for device integration tests.
//!
//! Every test builds a [`Harness`]: a mock daemon, a memory reporter, and a
//! context wired to both. Config helpers return devices with sensible
//! defaults on the mock's default bus addresses.

#![allow(dead_code)]

use std::sync::Arc;

use pinboard_core::DeviceId;
use pinboard_daemon::mock::MockDaemon;
use pinboard_devices::config::{
    ContextConfig, DeviceConfig, DeviceKind, Direction, ExpanderChip, GpioConfig, Mcp23xConfig,
    Mcp320xConfig, RelayConfig,
};
use pinboard_devices::{Context, Device, MemoryReporter};

/// Relay board address used by [`relay`].
pub const RELAY_ADDRESS: u8 = 0x10;

/// Expander address used by [`expander_input`].
pub const EXPANDER_ADDRESS: u8 = 0x20;

/// Line of the relay master used by [`relay_master`].
pub const MASTER_GPIO: u32 = 17;

pub struct Harness {
    pub daemon: MockDaemon,
    pub reporter: Arc<MemoryReporter>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        let daemon = MockDaemon::new();
        let reporter = Arc::new(MemoryReporter::new());
        let ctx = Context::open(
            ContextConfig::default(),
            Arc::new(daemon.clone()),
            reporter.clone(),
        );
        Self {
            daemon,
            reporter,
            ctx,
        }
    }

    /// Configure and start a device, panicking if it does not start.
    pub fn start(&self, config: DeviceConfig) -> Arc<Device> {
        let id = config.id.clone();
        self.ctx.configure(config).unwrap();
        self.ctx
            .get_or_start(&id, true)
            .unwrap_or_else(|| panic!("{id} failed to start"))
    }
}

pub fn id(name: &str) -> DeviceId {
    DeviceId::new(name).unwrap()
}

pub fn relay(name: &str, channel: u8) -> DeviceConfig {
    DeviceConfig::new(
        id(name),
        DeviceKind::Relay(RelayConfig {
            address: RELAY_ADDRESS,
            channel,
            ..RelayConfig::default()
        }),
    )
}

pub fn adc(name: &str) -> DeviceConfig {
    DeviceConfig::new(
        id(name),
        DeviceKind::Mcp320x(Mcp320xConfig {
            reference_voltage: 4.096,
            ..Mcp320xConfig::default()
        }),
    )
}

/// Inverted GPIO input relaying expander interrupts.
pub fn relay_master(name: &str, gpio: u32) -> DeviceConfig {
    DeviceConfig::new(
        id(name),
        DeviceKind::Gpio(GpioConfig {
            gpio,
            invert: true,
            callback: true,
            relay_master: true,
            ..GpioConfig::default()
        }),
    )
}

/// Input bit of an MCP23017, optionally relayed through `master`.
pub fn expander_input(name: &str, bit: u8, master: Option<&str>) -> DeviceConfig {
    DeviceConfig::new(
        id(name),
        DeviceKind::Mcp23x(Mcp23xConfig {
            chip: ExpanderChip::Mcp23017,
            address: EXPANDER_ADDRESS,
            bit,
            direction: Direction::Input,
            relay_master: master.map(id),
            ..Mcp23xConfig::default()
        }),
    )
}
