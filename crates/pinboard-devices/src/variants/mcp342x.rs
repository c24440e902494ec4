//! 18-bit I2C delta-sigma ADC (MCP3422/MCP3424).
//!
//! Each read writes a one-shot configuration byte, then polls the data
//! registers until the status byte reports the conversion done.

use std::sync::Arc;

use pinboard_core::{Error, Result};
use pinboard_daemon::{DaemonConnection, Handle};
use tracing::trace;

use super::{BusResources, Driver};
use crate::config::Mcp342xConfig;
use crate::state::{LogMode, Scaling, SensorState, StateSink, process_value};

/// Start a conversion (write) / conversion pending (read).
const READY_BIT: u8 = 0x80;

/// Conversion polls before giving up. An 18-bit conversion takes about
/// 270 ms and every poll is a daemon round trip.
pub const MAX_READY_POLLS: usize = 1000;

pub struct Mcp342x {
    connection: Arc<dyn DaemonConnection>,
    handle: Handle,
    config_byte: u8,
    resolution: u8,
    gain: u8,
    reference_voltage: f64,
    scaling: Scaling,
    sensor: SensorState,
}

impl Mcp342x {
    pub fn open(resources: &mut BusResources<'_>, config: &Mcp342xConfig) -> Result<Self> {
        let handle = resources.i2c(config.bus, config.address)?;
        Ok(Self {
            connection: resources.connection(),
            handle,
            config_byte: Self::config_byte(config.channel, config.resolution, config.gain),
            resolution: config.resolution,
            gain: config.gain,
            reference_voltage: config.reference_voltage,
            scaling: config.scaling.clone(),
            sensor: SensorState::default(),
        })
    }

    /// One-shot configuration byte for a channel, resolution, and gain.
    #[must_use]
    pub fn config_byte(channel: u8, resolution: u8, gain: u8) -> u8 {
        let sample_rate = match resolution {
            12 => 0,
            14 => 1,
            16 => 2,
            _ => 3,
        };
        let pga = match gain {
            2 => 1,
            4 => 2,
            8 => 3,
            _ => 0,
        };
        READY_BIT | ((channel & 0x03) << 5) | (sample_rate << 2) | pga
    }

    /// Bytes per data read: data bytes plus the trailing status byte.
    fn reply_len(&self) -> usize {
        if self.resolution == 18 { 4 } else { 3 }
    }

    /// Sign-extend the data bytes of a reply to a count.
    #[must_use]
    pub fn counts(data: &[u8], resolution: u8) -> i32 {
        let raw = data
            .iter()
            .fold(0i32, |acc, byte| (acc << 8) | i32::from(*byte));
        let bits = u32::from(resolution);
        let raw = raw & ((1 << bits) - 1);
        if raw & (1 << (bits - 1)) != 0 {
            raw - (1 << bits)
        } else {
            raw
        }
    }

    #[must_use]
    pub fn voltage(&self, counts: i32) -> f64 {
        let lsb_per_volt = f64::from(1u32 << (self.resolution - 1)) * f64::from(self.gain);
        self.reference_voltage * f64::from(counts) / lsb_per_volt
    }

    fn convert(&self) -> Result<i32> {
        self.connection
            .i2c_write_device(self.handle, &[self.config_byte])?;

        let len = self.reply_len();
        for poll in 1..=MAX_READY_POLLS {
            let reply = self.connection.i2c_read_device(self.handle, len)?;
            let Some((status, data)) = reply.split_last() else {
                return Err(Error::Daemon("empty ADC reply".to_string()));
            };
            if status & READY_BIT == 0 {
                trace!("Conversion ready after {} polls", poll);
                return Ok(Self::counts(data, self.resolution));
            }
        }
        Err(Error::ConversionTimeout(MAX_READY_POLLS))
    }
}

impl Driver for Mcp342x {
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        let counts = self.convert()?;
        let voltage = self.voltage(counts);
        process_value(sink, &self.scaling, &mut self.sensor, voltage, mode);
        Ok(())
    }
}
