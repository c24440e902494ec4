//! 12-bit SPI ADC (MCP3204/MCP3208).

use std::sync::Arc;

use pinboard_core::{Error, Result};
use pinboard_daemon::{DaemonConnection, Handle};
use tracing::warn;

use super::{BusResources, Driver};
use crate::config::Mcp320xConfig;
use crate::state::{LogMode, Scaling, SensorState, StateSink, process_value};

const FULL_SCALE: f64 = 4096.0;

/// Codes further apart than this fail the integrity check.
const INTEGRITY_TOLERANCE: u16 = 10;

pub struct Mcp320x {
    connection: Arc<dyn DaemonConnection>,
    handle: Handle,
    command: [u8; 3],
    reference_voltage: f64,
    integrity_check: bool,
    scaling: Scaling,
    sensor: SensorState,
}

impl Mcp320x {
    pub fn open(resources: &mut BusResources<'_>, config: &Mcp320xConfig) -> Result<Self> {
        let handle = resources.spi(config.spi_channel, config.bitrate)?;
        Ok(Self {
            connection: resources.connection(),
            handle,
            command: Self::command(config.channel, config.single_ended),
            reference_voltage: config.reference_voltage,
            integrity_check: config.integrity_check,
            scaling: config.scaling.clone(),
            sensor: SensorState::default(),
        })
    }

    /// Conversion request: start bit, mode, and channel select, with the
    /// result clocked out in the last two bytes.
    #[must_use]
    pub fn command(channel: u8, single_ended: bool) -> [u8; 3] {
        [
            0x04 | (u8::from(single_ended) << 1) | ((channel >> 2) & 0x01),
            (channel & 0x03) << 6,
            0x00,
        ]
    }

    /// Extract the 12-bit code from a conversion reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Daemon`] if the reply is shorter than the request.
    pub fn decode(reply: &[u8]) -> Result<u16> {
        match reply {
            [_, high, low, ..] => Ok((u16::from(high & 0x0F) << 8) | u16::from(*low)),
            _ => Err(Error::Daemon(format!(
                "short ADC reply: {} bytes",
                reply.len()
            ))),
        }
    }

    #[must_use]
    pub fn voltage(&self, code: u16) -> f64 {
        self.reference_voltage * f64::from(code) / FULL_SCALE
    }

    fn sample(&self) -> Result<u16> {
        let reply = self.connection.spi_xfer(self.handle, &self.command)?;
        Self::decode(&reply)
    }
}

impl Driver for Mcp320x {
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        let code = if self.integrity_check {
            let first = self.sample()?;
            let second = self.sample()?;
            if first.abs_diff(second) > INTEGRITY_TOLERANCE {
                warn!(
                    "\"{}\" unstable conversion: codes {} and {} differ by more than {}",
                    sink.name, first, second, INTEGRITY_TOLERANCE
                );
            }
            second
        } else {
            self.sample()?
        };

        let voltage = self.voltage(code);
        process_value(sink, &self.scaling, &mut self.sensor, voltage, mode);
        Ok(())
    }
}
