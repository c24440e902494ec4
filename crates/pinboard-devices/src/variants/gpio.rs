//! Native GPIO line on the daemon host.
//!
//! Inputs can report edges through a daemon callback, optionally debounced.
//! An input configured as relay master turns edges into interrupt dispatch
//! for the expander chips wired to it; while the line is asserted a watchdog
//! is armed so a stuck interrupt gets reset. Outputs can run PWM while on.

use std::sync::Arc;
use std::time::Instant;

use pinboard_core::Result;
use pinboard_daemon::{CallbackId, DaemonConnection, Edge, EdgeCallback, EdgeEvent, EdgeLevel, Handle};
use tracing::{debug, info, trace, warn};

use super::{BusResources, Driver, WriteOutcome, note_failure, switch_value};
use crate::config::{Direction, GpioConfig, PwmConfig};
use crate::state::{LogMode, StateSink, update_on_off};

/// What the owning device must do after an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAction {
    /// Nothing beyond the state update.
    None,
    /// Relay master asserted: ask the sources who interrupted.
    Dispatch,
    /// Relay master watchdog expired: reset every source, then call
    /// [`GpioPin::finish_recovery`].
    Recover,
}

pub struct GpioPin {
    connection: Arc<dyn DaemonConnection>,
    handle: Handle,
    chip: u32,
    gpio: u32,
    direction: Direction,
    invert: bool,
    relay_master: bool,
    watchdog_us: u32,
    pwm: Option<PwmConfig>,
    callback: Option<CallbackId>,
    pwm_active: bool,
    state: Option<bool>,
    last_edge: Option<Instant>,
}

impl GpioPin {
    pub fn open(
        resources: &mut BusResources<'_>,
        config: &GpioConfig,
        on_edge: EdgeCallback,
    ) -> Result<Self> {
        let chip = config.chip.unwrap_or(resources.host().gpio_chip);
        let handle = resources.gpio_chip(chip)?;
        let connection = resources.connection();

        let mut pin = Self {
            connection,
            handle,
            chip,
            gpio: config.gpio,
            direction: config.direction,
            invert: config.invert,
            relay_master: config.relay_master,
            watchdog_us: config.watchdog_ms.saturating_mul(1000),
            pwm: config.pwm,
            callback: None,
            pwm_active: false,
            state: None,
            last_edge: None,
        };

        match config.direction {
            Direction::Input => {
                pin.connection
                    .gpio_claim_input(handle, config.gpio, config.pull)?;
                if let Some(micros) = config.debounce_us {
                    pin.connection
                        .gpio_set_debounce(handle, config.gpio, micros)?;
                }
                if config.callback || config.relay_master {
                    let id = pin
                        .connection
                        .callback(handle, config.gpio, Edge::Both, on_edge)?;
                    pin.callback = Some(id);
                }
            }
            Direction::Output => {
                pin.connection
                    .gpio_claim_output(handle, config.gpio, false)?;
            }
        }

        debug!(
            "Claimed gpiochip{} line {} as {:?}",
            chip, config.gpio, config.direction
        );
        Ok(pin)
    }

    fn asserted(&self, level: bool) -> bool {
        level != self.invert
    }

    /// Process an edge reported by the daemon.
    pub fn on_edge(&mut self, sink: &StateSink<'_>, event: EdgeEvent) -> Result<EdgeAction> {
        let level = match event.level {
            EdgeLevel::High => true,
            EdgeLevel::Low => false,
            EdgeLevel::WatchdogTimeout => {
                if !self.relay_master {
                    return Ok(EdgeAction::None);
                }
                warn!(
                    "\"{}\" interrupt still asserted after {} us; resetting sources",
                    sink.name, self.watchdog_us
                );
                return Ok(EdgeAction::Recover);
            }
        };

        let now = Instant::now();
        if let Some(previous) = self.last_edge.replace(now) {
            trace!(
                "\"{}\" edge after {:?}",
                sink.name,
                now.duration_since(previous)
            );
        }

        let asserted = self.asserted(level);
        let mode = if self.relay_master {
            LogMode::Suppressed
        } else {
            LogMode::Changes
        };
        update_on_off(sink, &mut self.state, asserted, mode);

        if !self.relay_master {
            return Ok(EdgeAction::None);
        }
        if asserted {
            self.connection
                .gpio_set_watchdog(self.handle, self.gpio, self.watchdog_us)?;
            Ok(EdgeAction::Dispatch)
        } else {
            self.connection
                .gpio_set_watchdog(self.handle, self.gpio, 0)?;
            Ok(EdgeAction::None)
        }
    }

    /// Disarm the watchdog after the sources were reset and check the line.
    ///
    /// Returns whether the interrupt is still asserted.
    pub fn finish_recovery(&mut self, sink: &StateSink<'_>) -> Result<bool> {
        self.connection
            .gpio_set_watchdog(self.handle, self.gpio, 0)?;
        let level = self.connection.gpio_read(self.handle, self.gpio)?;
        let asserted = self.asserted(level);
        update_on_off(sink, &mut self.state, asserted, LogMode::Suppressed);
        if asserted {
            warn!("\"{}\" interrupt still asserted after reset", sink.name);
        } else {
            info!("\"{}\" interrupt recovered", sink.name);
        }
        Ok(asserted)
    }

    #[must_use]
    pub fn chip(&self) -> u32 {
        self.chip
    }
}

impl Driver for GpioPin {
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        let level = self.connection.gpio_read(self.handle, self.gpio)?;
        let on = match self.direction {
            Direction::Input => self.asserted(level),
            Direction::Output => level || self.pwm_active,
        };
        update_on_off(sink, &mut self.state, on, mode);
        Ok(())
    }

    fn write(&mut self, sink: &StateSink<'_>, value: f64, mode: LogMode) -> Result<WriteOutcome> {
        if self.direction == Direction::Input {
            warn!("\"{}\" is an input; ignoring write of {}", sink.name, value);
            return Ok(WriteOutcome::Ignored);
        }
        let Some(on) = switch_value(value) else {
            warn!("\"{}\" output value must be 0 or 1, got {}", sink.name, value);
            return Ok(WriteOutcome::Ignored);
        };

        match self.pwm {
            Some(pwm) if on => {
                if !self.pwm_active {
                    self.connection.tx_pwm(
                        self.handle,
                        self.gpio,
                        pwm.frequency,
                        pwm.duty_percent,
                    )?;
                    self.pwm_active = true;
                }
            }
            Some(_) => {
                if self.pwm_active {
                    self.connection.tx_pwm(self.handle, self.gpio, 0.0, 0.0)?;
                    self.pwm_active = false;
                }
                self.connection.gpio_write(self.handle, self.gpio, false)?;
            }
            None => self.connection.gpio_write(self.handle, self.gpio, on)?,
        }

        update_on_off(sink, &mut self.state, on, mode);
        Ok(if on { WriteOutcome::On } else { WriteOutcome::Off })
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut failure = None;
        if let Some(id) = self.callback.take() {
            let result = self.connection.cancel_callback(id);
            note_failure(&mut failure, "cancel callback", result.map_err(Into::into));
        }
        if self.relay_master {
            let result = self.connection.gpio_set_watchdog(self.handle, self.gpio, 0);
            note_failure(&mut failure, "disarm watchdog", result.map_err(Into::into));
        }
        if self.pwm_active {
            self.pwm_active = false;
            let result = self.connection.tx_pwm(self.handle, self.gpio, 0.0, 0.0);
            note_failure(&mut failure, "stop PWM", result.map_err(Into::into));
        }
        failure.map_or(Ok(()), Err)
    }
}
