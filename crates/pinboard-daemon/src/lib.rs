//! Remote GPIO daemon capability for the pinboard device manager.
//!
//! This crate defines the interface through which devices reach the remote
//! daemon that owns the physical buses of a single-board computer: GPIO chip
//! sets, I2C devices, and SPI channels. The daemon's wire protocol is not
//! modelled; implementations of [`DaemonConnection`] encapsulate it.
//!
//! # Capabilities
//!
//! - [`DaemonConnector`] opens sessions (`openConnection`).
//! - [`DaemonConnection`] exposes handle management, synchronous byte-level
//!   transfers, edge callbacks, and a per-line watchdog.
//!
//! # Error Handling
//!
//! All operations return [`Result<T>`][error::Result] with [`DaemonError`].
//! Connection-class failures convert into `pinboard_core::Error::Connection`
//! so the device layer can tag them distinctly from other start errors.
//!
//! # Mock Implementation
//!
//! With the default `mock` feature the crate ships [`mock::MockDaemon`], an
//! in-process daemon with register files, scripted replies, and an edge
//! callback registry, for tests and simulation without hardware.

pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod traits;
pub mod types;

pub use error::{DaemonError, Result};
pub use traits::{DaemonConnection, DaemonConnector};
pub use types::{CallbackId, Edge, EdgeCallback, EdgeEvent, EdgeLevel, Handle, PullMode};
