//! 12-bit SPI DAC (MCP4822).

use std::sync::Arc;

use pinboard_core::Result;
use pinboard_daemon::{DaemonConnection, Handle};
use tracing::warn;

use super::{BusResources, Driver, WriteOutcome};
use crate::config::Mcp482xConfig;
use crate::state::{LogMode, Scaling, SensorState, StateSink, process_value};

const FULL_SCALE: f64 = 4096.0;

/// Output enabled (not shut down).
const ACTIVE: u8 = 0x10;

/// Gain select: set for 1x, clear for 2x.
const GAIN_1X: u8 = 0x20;

pub struct Mcp482x {
    connection: Arc<dyn DaemonConnection>,
    handle: Handle,
    channel: u8,
    gain: u8,
    reference_voltage: f64,
    scaling: Scaling,
    sensor: SensorState,
    last_voltage: Option<f64>,
}

impl Mcp482x {
    pub fn open(resources: &mut BusResources<'_>, config: &Mcp482xConfig) -> Result<Self> {
        let handle = resources.spi(config.spi_channel, config.bitrate)?;
        Ok(Self {
            connection: resources.connection(),
            handle,
            channel: config.channel,
            gain: config.gain,
            reference_voltage: config.reference_voltage,
            scaling: config.scaling.clone(),
            sensor: SensorState::default(),
            last_voltage: None,
        })
    }

    /// Input code for `voltage`, or `None` if it cannot be produced.
    #[must_use]
    pub fn code(&self, voltage: f64) -> Option<u16> {
        if !voltage.is_finite() {
            return None;
        }
        let code = (voltage * FULL_SCALE / (self.reference_voltage * f64::from(self.gain))).floor();
        if (0.0..FULL_SCALE).contains(&code) {
            Some(code as u16)
        } else {
            None
        }
    }

    /// Write command for `code` on this DAC's output.
    #[must_use]
    pub fn command(&self, code: u16) -> [u8; 2] {
        let gain = if self.gain == 1 { GAIN_1X } else { 0 };
        let [high, low] = code.to_be_bytes();
        [((self.channel & 0x01) << 7) | gain | ACTIVE | (high & 0x0F), low]
    }
}

impl Driver for Mcp482x {
    /// Report the last written value again.
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        if let Some(voltage) = self.last_voltage {
            process_value(sink, &self.scaling, &mut self.sensor, voltage, mode);
        }
        Ok(())
    }

    fn write(&mut self, sink: &StateSink<'_>, value: f64, mode: LogMode) -> Result<WriteOutcome> {
        let Some(code) = self.code(value) else {
            warn!(
                "\"{}\" cannot output {} V (range 0 to {} V)",
                sink.name,
                value,
                self.reference_voltage * f64::from(self.gain)
            );
            return Ok(WriteOutcome::Ignored);
        };

        self.connection.spi_xfer(self.handle, &self.command(code))?;
        self.last_voltage = Some(value);
        process_value(sink, &self.scaling, &mut self.sensor, value, mode);
        Ok(WriteOutcome::Value)
    }
}
