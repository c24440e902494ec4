//! Device manager for GPIO, I2C, and SPI peripherals behind a remote daemon.
//!
//! This crate turns device configurations into running logical devices on a
//! single-board computer reached through [`pinboard_daemon`]. It provides:
//!
//! - [`pool::ResourcePool`]: reference-counted sharing of daemon
//!   connections and bus handles
//! - [`events::TriggerDispatcher`]: named triggers with per-event rate
//!   limiting
//! - [`device::Device`]: lifecycle, the standard error path, polling, and
//!   momentary outputs
//! - [`variants`]: drivers for SPI and I2C ADCs, an SPI DAC, an I2C relay
//!   board, I/O expanders, and native GPIO lines
//! - [`interrupt`]: relaying expander interrupts through a GPIO master
//! - [`context::Context`]: configurations, the device directory, and lazy
//!   device start
//! - [`scheduler::PollScheduler`]: periodic polling on a tokio runtime
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pinboard_core::DeviceId;
//! use pinboard_daemon::mock::MockDaemon;
//! use pinboard_devices::config::{ContextConfig, DeviceConfig, DeviceKind, RelayConfig};
//! use pinboard_devices::context::Context;
//! use pinboard_devices::report::MemoryReporter;
//!
//! # fn main() -> pinboard_core::Result<()> {
//! let daemon = MockDaemon::new();
//! let reporter = Arc::new(MemoryReporter::new());
//! let ctx = Context::open(ContextConfig::default(), Arc::new(daemon.clone()), reporter.clone());
//!
//! let id = DeviceId::new("pump")?;
//! ctx.configure(DeviceConfig::new(id.clone(), DeviceKind::Relay(RelayConfig::default())))?;
//!
//! let pump = ctx.get_or_start(&id, true).expect("pump starts");
//! pump.write(1.0);
//! assert_eq!(reporter.last_on_off(&id), Some(true));
//!
//! ctx.close();
//! assert_eq!(daemon.open_handles(), 0);
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod context;
pub mod device;
pub mod directory;
pub mod events;
pub mod interrupt;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod state;
pub mod variants;

pub use config::{ContextConfig, DeviceConfig, DeviceFile, DeviceKind};
pub use context::Context;
pub use device::{Device, Lifecycle};
pub use events::{EventName, FireOutcome, TriggerDispatcher, TriggerEvent, TriggerFilter};
pub use pool::{HostInfo, ResourcePool, Session};
pub use report::{LogReporter, MemoryReporter, StateReporter, StateUpdate};
pub use scheduler::{PollScheduler, SchedulerHandle};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
