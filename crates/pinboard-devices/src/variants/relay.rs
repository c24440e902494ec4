//! I2C relay board. Each channel is a register; writing 0xFF closes the
//! relay and 0x00 opens it.

use std::sync::Arc;

use pinboard_core::Result;
use pinboard_daemon::{DaemonConnection, Handle};
use tracing::warn;

use super::{BusResources, Driver, WriteOutcome, switch_value};
use crate::config::RelayConfig;
use crate::state::{LogMode, StateSink, update_on_off};

const RELAY_ON: u8 = 0xFF;
const RELAY_OFF: u8 = 0x00;

pub struct RelayBoard {
    connection: Arc<dyn DaemonConnection>,
    handle: Handle,
    channel: u8,
    state: Option<bool>,
}

impl RelayBoard {
    pub fn open(resources: &mut BusResources<'_>, config: &RelayConfig) -> Result<Self> {
        let handle = resources.i2c(config.bus, config.address)?;
        Ok(Self {
            connection: resources.connection(),
            handle,
            channel: config.channel,
            state: None,
        })
    }
}

impl Driver for RelayBoard {
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        let value = self
            .connection
            .i2c_read_byte_data(self.handle, self.channel)?;
        update_on_off(sink, &mut self.state, value != RELAY_OFF, mode);
        Ok(())
    }

    fn write(&mut self, sink: &StateSink<'_>, value: f64, mode: LogMode) -> Result<WriteOutcome> {
        let Some(on) = switch_value(value) else {
            warn!("\"{}\" relay value must be 0 or 1, got {}", sink.name, value);
            return Ok(WriteOutcome::Ignored);
        };

        let register_value = if on { RELAY_ON } else { RELAY_OFF };
        self.connection
            .i2c_write_byte_data(self.handle, self.channel, register_value)?;
        update_on_off(sink, &mut self.state, on, mode);
        Ok(if on { WriteOutcome::On } else { WriteOutcome::Off })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variants::testing::Bench;

    fn relay(bench: &Bench) -> RelayBoard {
        RelayBoard::open(&mut bench.resources(), &RelayConfig::default()).unwrap()
    }

    #[test]
    fn test_write_sets_channel_register() {
        let bench = Bench::new();
        let mut relay = relay(&bench);

        assert_eq!(
            relay.write(&bench.sink(), 1.0, LogMode::Changes).unwrap(),
            WriteOutcome::On
        );
        assert_eq!(bench.daemon.i2c_register(1, 0x10, 1), 0xFF);

        assert_eq!(
            relay.write(&bench.sink(), 0.0, LogMode::Changes).unwrap(),
            WriteOutcome::Off
        );
        assert_eq!(bench.daemon.i2c_writes(1, 0x10), vec![vec![1, 0xFF], vec![1, 0x00]]);
    }

    #[test]
    fn test_invalid_value_is_ignored() {
        let bench = Bench::new();
        let mut relay = relay(&bench);

        let outcome = relay.write(&bench.sink(), 0.5, LogMode::Changes).unwrap();

        assert_eq!(outcome, WriteOutcome::Ignored);
        assert!(bench.daemon.i2c_writes(1, 0x10).is_empty());
        assert!(bench.reporter.history().is_empty());
    }

    #[test]
    fn test_read_reflects_register() {
        let bench = Bench::new();
        let mut relay = relay(&bench);
        bench.daemon.set_i2c_register(1, 0x10, 1, 0xFF);

        relay.read(&bench.sink(), LogMode::Changes).unwrap();

        assert_eq!(bench.reporter.last_on_off(&bench.device), Some(true));
    }

    #[test]
    fn test_bus_fault_propagates() {
        let bench = Bench::new();
        let mut relay = relay(&bench);
        bench.daemon.set_i2c_fault(1, 0x10, true);

        assert!(relay.read(&bench.sink(), LogMode::Changes).is_err());
    }
}
