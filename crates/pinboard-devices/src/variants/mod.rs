//! Device variant drivers.
//!
//! Each variant talks to one kind of chip through the daemon's byte-level
//! bus operations. Drivers are plain synchronous state machines: the owning
//! [`Device`](crate::device::Device) serializes access, catches their
//! errors, and runs the standard error path.
//!
//! [`AnyDriver`] wraps the concrete drivers for static dispatch.

pub mod gpio;
pub mod mcp23x;
pub mod mcp320x;
pub mod mcp342x;
pub mod mcp482x;
pub mod relay;

use std::sync::Arc;

use pinboard_core::{Error, ResourceId, Result};
use pinboard_daemon::{DaemonConnection, EdgeCallback, Handle};
use tracing::{debug, warn};

use crate::config::DeviceKind;
use crate::pool::{HostInfo, ResourcePool, Session};
use crate::state::{LogMode, StateSink};

pub use gpio::{EdgeAction, GpioPin};
pub use mcp23x::{Mcp23x, Register};
pub use mcp320x::Mcp320x;
pub use mcp342x::Mcp342x;
pub use mcp482x::Mcp482x;
pub use relay::RelayBoard;

/// What a write did to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Binary output switched on.
    On,
    /// Binary output switched off.
    Off,
    /// Analog output updated.
    Value,
    /// Value rejected; nothing was written.
    Ignored,
}

/// Common operations of every variant.
pub trait Driver: Send {
    /// Read the device and publish its state.
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()>;

    /// Drive an output. Variants without outputs ignore writes.
    fn write(&mut self, sink: &StateSink<'_>, value: f64, _mode: LogMode) -> Result<WriteOutcome> {
        warn!("\"{}\" does not accept writes (got {})", sink.name, value);
        Ok(WriteOutcome::Ignored)
    }

    /// Undo hardware setup before the device's handles are released.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Parse a binary output value. Only exactly 0 and 1 are accepted.
pub(crate) fn switch_value(value: f64) -> Option<bool> {
    if value == 0.0 {
        Some(false)
    } else if value == 1.0 {
        Some(true)
    } else {
        None
    }
}

/// Log a failed shutdown step and keep the first failure.
///
/// Shutdown runs every step even when an earlier one fails.
pub(crate) fn note_failure(first: &mut Option<Error>, step: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("Shutdown step \"{}\" failed: {}", step, e);
        first.get_or_insert(e);
    }
}

/// Handle acquisition on behalf of one device.
///
/// Every handle acquired is recorded so the device can release it on stop,
/// including when driver setup fails halfway.
pub struct BusResources<'a> {
    pool: &'a ResourcePool,
    session: &'a Session,
    connection_id: &'a ResourceId,
    acquired: Vec<ResourceId>,
}

impl<'a> BusResources<'a> {
    pub(crate) fn new(
        pool: &'a ResourcePool,
        session: &'a Session,
        connection_id: &'a ResourceId,
    ) -> Self {
        Self {
            pool,
            session,
            connection_id,
            acquired: Vec::new(),
        }
    }

    pub fn connection(&self) -> Arc<dyn DaemonConnection> {
        Arc::clone(&self.session.connection)
    }

    pub fn host(&self) -> &HostInfo {
        &self.session.host
    }

    pub fn gpio_chip(&mut self, chip: u32) -> Result<Handle> {
        let id = self.connection_id.gpio_chip(chip);
        self.acquire(id, |c| Ok(c.gpiochip_open(chip)?))
    }

    pub fn i2c(&mut self, bus: u32, address: u8) -> Result<Handle> {
        self.i2c_with_setup(bus, address, |_, _| Ok(()))
    }

    /// Acquire an I2C handle, running `setup` only when this call opens it.
    ///
    /// Other devices wanting the same handle wait until `setup` finishes. If
    /// it fails the handle is closed again and nothing is recorded.
    pub fn i2c_with_setup<S>(&mut self, bus: u32, address: u8, setup: S) -> Result<Handle>
    where
        S: FnOnce(&dyn DaemonConnection, Handle) -> Result<()>,
    {
        let id = self.connection_id.i2c(bus, address);
        self.acquire(id, |c| {
            let handle = c.i2c_open(bus, address)?;
            if let Err(e) = setup(c, handle) {
                if let Err(close_err) = c.i2c_close(handle) {
                    debug!("Closing I2C handle {} after failed setup: {}", handle, close_err);
                }
                return Err(e);
            }
            Ok(handle)
        })
    }

    pub fn spi(&mut self, channel: u32, bitrate: u32) -> Result<Handle> {
        self.spi_with_setup(channel, bitrate, |_, _| Ok(()))
    }

    /// SPI counterpart of [`i2c_with_setup`](Self::i2c_with_setup).
    pub fn spi_with_setup<S>(&mut self, channel: u32, bitrate: u32, setup: S) -> Result<Handle>
    where
        S: FnOnce(&dyn DaemonConnection, Handle) -> Result<()>,
    {
        let id = self.connection_id.spi(channel, bitrate);
        self.acquire(id, |c| {
            let handle = c.spi_open(channel, bitrate, 0)?;
            if let Err(e) = setup(c, handle) {
                if let Err(close_err) = c.spi_close(handle) {
                    debug!("Closing SPI handle {} after failed setup: {}", handle, close_err);
                }
                return Err(e);
            }
            Ok(handle)
        })
    }

    fn acquire<F>(&mut self, id: ResourceId, factory: F) -> Result<Handle>
    where
        F: FnOnce(&dyn DaemonConnection) -> Result<Handle>,
    {
        let handle = self
            .pool
            .acquire_handle(&id, &self.session.connection, factory)?;
        self.acquired.push(id);
        Ok(handle)
    }

    pub(crate) fn into_acquired(self) -> Vec<ResourceId> {
        self.acquired
    }
}

/// Static dispatch over all variants.
pub enum AnyDriver {
    Mcp320x(Mcp320x),
    Mcp342x(Mcp342x),
    Mcp482x(Mcp482x),
    Relay(RelayBoard),
    Mcp23x(Mcp23x),
    Gpio(GpioPin),
}

impl AnyDriver {
    /// Set up the driver for `kind`.
    ///
    /// `on_edge` is registered with the daemon by GPIO inputs that report
    /// edges; other variants ignore it.
    pub fn open(
        kind: &DeviceKind,
        resources: &mut BusResources<'_>,
        on_edge: EdgeCallback,
    ) -> Result<Self> {
        Ok(match kind {
            DeviceKind::Mcp320x(config) => Self::Mcp320x(Mcp320x::open(resources, config)?),
            DeviceKind::Mcp342x(config) => Self::Mcp342x(Mcp342x::open(resources, config)?),
            DeviceKind::Mcp482x(config) => Self::Mcp482x(Mcp482x::open(resources, config)?),
            DeviceKind::Relay(config) => Self::Relay(RelayBoard::open(resources, config)?),
            DeviceKind::Mcp23x(config) => Self::Mcp23x(Mcp23x::open(resources, config)?),
            DeviceKind::Gpio(config) => Self::Gpio(GpioPin::open(resources, config, on_edge)?),
        })
    }

    pub fn as_expander_mut(&mut self) -> Option<&mut Mcp23x> {
        match self {
            Self::Mcp23x(expander) => Some(expander),
            _ => None,
        }
    }

    pub fn as_gpio_mut(&mut self) -> Option<&mut GpioPin> {
        match self {
            Self::Gpio(pin) => Some(pin),
            _ => None,
        }
    }
}

impl Driver for AnyDriver {
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        match self {
            Self::Mcp320x(driver) => driver.read(sink, mode),
            Self::Mcp342x(driver) => driver.read(sink, mode),
            Self::Mcp482x(driver) => driver.read(sink, mode),
            Self::Relay(driver) => driver.read(sink, mode),
            Self::Mcp23x(driver) => driver.read(sink, mode),
            Self::Gpio(driver) => driver.read(sink, mode),
        }
    }

    fn write(&mut self, sink: &StateSink<'_>, value: f64, mode: LogMode) -> Result<WriteOutcome> {
        match self {
            Self::Mcp320x(driver) => driver.write(sink, value, mode),
            Self::Mcp342x(driver) => driver.write(sink, value, mode),
            Self::Mcp482x(driver) => driver.write(sink, value, mode),
            Self::Relay(driver) => driver.write(sink, value, mode),
            Self::Mcp23x(driver) => driver.write(sink, value, mode),
            Self::Gpio(driver) => driver.write(sink, value, mode),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Mcp320x(driver) => driver.shutdown(),
            Self::Mcp342x(driver) => driver.shutdown(),
            Self::Mcp482x(driver) => driver.shutdown(),
            Self::Relay(driver) => driver.shutdown(),
            Self::Mcp23x(driver) => driver.shutdown(),
            Self::Gpio(driver) => driver.shutdown(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the variant tests.

    use super::*;
    use crate::events::TriggerDispatcher;
    use crate::report::MemoryReporter;
    use pinboard_core::DeviceId;
    use pinboard_core::constants::HOST_MODEL_PATH;
    use pinboard_daemon::mock::MockDaemon;

    pub struct Bench {
        pub daemon: MockDaemon,
        pub pool: ResourcePool,
        pub session: Session,
        pub connection_id: ResourceId,
        pub reporter: MemoryReporter,
        pub triggers: TriggerDispatcher,
        pub device: DeviceId,
    }

    impl Bench {
        pub fn new() -> Self {
            let daemon = MockDaemon::new();
            let pool = ResourcePool::new();
            let connection_id = ResourceId::connection("pi", 8889);
            let session = pool
                .acquire_connection(&connection_id, || {
                    Session::open(&daemon, "pi", 8889, HOST_MODEL_PATH)
                })
                .unwrap();
            Self {
                daemon,
                pool,
                session,
                connection_id,
                reporter: MemoryReporter::new(),
                triggers: TriggerDispatcher::new(),
                device: DeviceId::new("dut").unwrap(),
            }
        }

        pub fn resources(&self) -> BusResources<'_> {
            BusResources::new(&self.pool, &self.session, &self.connection_id)
        }

        pub fn sink(&self) -> StateSink<'_> {
            StateSink {
                device: &self.device,
                name: "dut",
                reporter: &self.reporter,
                triggers: &self.triggers,
            }
        }
    }

    pub fn no_edges() -> EdgeCallback {
        Arc::new(|_event: pinboard_daemon::EdgeEvent| {})
    }
}
