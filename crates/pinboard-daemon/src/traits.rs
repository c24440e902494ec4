//! Capability traits for the remote GPIO daemon.
//!
//! The daemon performs bus-level I/O on behalf of this process. Its wire
//! protocol is hidden behind [`DaemonConnection`]; device code only sees
//! handles and byte-level transfers.
//!
//! # Blocking Semantics
//!
//! Every method is a synchronous round trip and blocks the calling thread
//! until the daemon answers. No timeout is modelled here: a hung daemon
//! stalls the caller.
//!
//! # Object Safety
//!
//! Unlike device traits that are awaited, these traits are object-safe so a
//! connection can be shared as `Arc<dyn DaemonConnection>` between devices,
//! the resource pool, and callback closures.
//!
//! # Examples
//!
//! ```
//! use pinboard_daemon::mock::MockDaemon;
//! use pinboard_daemon::traits::DaemonConnector;
//!
//! # fn main() -> pinboard_daemon::Result<()> {
//! let daemon = MockDaemon::new();
//! let connection = daemon.open("localhost", 8889)?;
//! assert!(connection.is_live());
//!
//! let handle = connection.i2c_open(1, 0x20)?;
//! connection.i2c_write_byte_data(handle, 0x00, 0xFF)?;
//! assert_eq!(connection.i2c_read_byte_data(handle, 0x00)?, 0xFF);
//!
//! connection.i2c_close(handle)?;
//! connection.close()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::Result;
use crate::types::{CallbackId, Edge, EdgeCallback, Handle, PullMode};

/// Opens connections to daemon instances.
pub trait DaemonConnector: Send + Sync {
    /// Open a session with the daemon at `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Unreachable`](crate::DaemonError::Unreachable)
    /// if the daemon cannot be reached.
    fn open(&self, host: &str, port: u16) -> Result<Arc<dyn DaemonConnection>>;
}

/// An open session with one daemon instance.
pub trait DaemonConnection: Send + Sync {
    /// Whether the session is still usable.
    fn is_live(&self) -> bool;

    /// Close the session. Handles opened on it become invalid.
    fn close(&self) -> Result<()>;

    /// Read a file on the daemon host.
    fn file_read(&self, path: &str) -> Result<Vec<u8>>;

    // GPIO chip

    fn gpiochip_open(&self, chip: u32) -> Result<Handle>;

    fn gpiochip_close(&self, handle: Handle) -> Result<()>;

    fn gpio_claim_input(&self, handle: Handle, gpio: u32, pull: PullMode) -> Result<()>;

    fn gpio_claim_output(&self, handle: Handle, gpio: u32, level: bool) -> Result<()>;

    fn gpio_read(&self, handle: Handle, gpio: u32) -> Result<bool>;

    fn gpio_write(&self, handle: Handle, gpio: u32, level: bool) -> Result<()>;

    /// Suppress edges shorter than `micros`. Zero disables the filter.
    fn gpio_set_debounce(&self, handle: Handle, gpio: u32, micros: u32) -> Result<()>;

    /// Arm a watchdog that reports a timeout if no edge occurs within
    /// `micros`. Zero disarms it.
    fn gpio_set_watchdog(&self, handle: Handle, gpio: u32, micros: u32) -> Result<()>;

    /// Start PWM on a line. A frequency or duty cycle of zero stops it.
    fn tx_pwm(&self, handle: Handle, gpio: u32, frequency: f64, duty_percent: f64) -> Result<()>;

    /// Register a callback invoked on the daemon's callback thread.
    fn callback(
        &self,
        handle: Handle,
        gpio: u32,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<CallbackId>;

    /// Cancel a callback. Once this returns the callback is not invoked again.
    fn cancel_callback(&self, id: CallbackId) -> Result<()>;

    // I2C

    fn i2c_open(&self, bus: u32, address: u8) -> Result<Handle>;

    fn i2c_close(&self, handle: Handle) -> Result<()>;

    fn i2c_read_byte_data(&self, handle: Handle, register: u8) -> Result<u8>;

    fn i2c_write_byte_data(&self, handle: Handle, register: u8, value: u8) -> Result<()>;

    fn i2c_read_device(&self, handle: Handle, count: usize) -> Result<Vec<u8>>;

    fn i2c_write_device(&self, handle: Handle, data: &[u8]) -> Result<()>;

    // SPI

    fn spi_open(&self, channel: u32, bitrate: u32, flags: u32) -> Result<Handle>;

    fn spi_close(&self, handle: Handle) -> Result<()>;

    /// Full-duplex transfer; the reply has the same length as `data`.
    fn spi_xfer(&self, handle: Handle, data: &[u8]) -> Result<Vec<u8>>;
}
