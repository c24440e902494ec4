//! Device and context configuration.
//!
//! Configuration is supplied by the host application, usually as JSON. Each
//! [`DeviceConfig`] carries the common settings plus a [`DeviceKind`] tagged
//! with its variant. Durations are expressed in seconds as floats.
//!
//! # Example
//!
//! ```json
//! {
//!   "context": { "poll_period_secs": 0.5 },
//!   "devices": [
//!     {
//!       "id": "pump",
//!       "name": "Pump relay",
//!       "host": { "address": "pi4.local" },
//!       "kind": { "type": "relay", "bus": 1, "address": 16, "channel": 1 }
//!     }
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use pinboard_core::constants::{
    DEFAULT_DAEMON_PORT, DEFAULT_POLL_PERIOD, DEFAULT_WATCHDOG_MS, HOST_MODEL_PATH,
};
use pinboard_core::{DeviceId, Error, Result};
use pinboard_daemon::PullMode;
use serde::{Deserialize, Serialize};

use crate::state::Scaling;

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(if value.is_finite() { value.max(0.0) } else { 0.0 })
}

/// Settings shared by all devices of one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Period of the poll scheduler.
    pub poll_period_secs: f64,

    /// File read on the daemon host to identify its model.
    pub model_path: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            poll_period_secs: DEFAULT_POLL_PERIOD.as_secs_f64(),
            model_path: HOST_MODEL_PATH.to_string(),
        }
    }
}

impl ContextConfig {
    pub fn poll_period(&self) -> Duration {
        secs(self.poll_period_secs)
    }
}

/// Daemon address of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_DAEMON_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,

    /// Minimum time between polled reads.
    pub interval_secs: f64,

    /// Window over which the observed poll rate is logged.
    pub status_interval_secs: Option<f64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 1.0,
            status_interval_secs: None,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        self.status_interval_secs
            .filter(|value| *value > 0.0)
            .map(secs)
    }
}

/// Direction of a digital line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Input,
    Output,
}

/// 12-bit SPI ADC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mcp320xConfig {
    pub spi_channel: u32,
    pub bitrate: u32,

    /// ADC input, 0..=7.
    pub channel: u8,
    pub single_ended: bool,
    pub reference_voltage: f64,

    /// Sample twice and warn when the codes disagree.
    pub integrity_check: bool,
    pub scaling: Scaling,
}

impl Default for Mcp320xConfig {
    fn default() -> Self {
        Self {
            spi_channel: 0,
            bitrate: 1_000_000,
            channel: 0,
            single_ended: true,
            reference_voltage: 3.3,
            integrity_check: false,
            scaling: Scaling::default(),
        }
    }
}

/// 18-bit I2C delta-sigma ADC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mcp342xConfig {
    pub bus: u32,
    pub address: u8,

    /// ADC input, 0..=3.
    pub channel: u8,

    /// Sample resolution in bits: 12, 14, 16 or 18.
    pub resolution: u8,

    /// PGA gain: 1, 2, 4 or 8.
    pub gain: u8,
    pub reference_voltage: f64,
    pub scaling: Scaling,
}

impl Default for Mcp342xConfig {
    fn default() -> Self {
        Self {
            bus: 1,
            address: 0x68,
            channel: 0,
            resolution: 18,
            gain: 1,
            reference_voltage: 2.048,
            scaling: Scaling::default(),
        }
    }
}

/// 12-bit SPI DAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mcp482xConfig {
    pub spi_channel: u32,
    pub bitrate: u32,

    /// DAC output: 0 for A, 1 for B.
    pub channel: u8,

    /// Output gain: 1 or 2.
    pub gain: u8,
    pub reference_voltage: f64,
    pub scaling: Scaling,
}

impl Default for Mcp482xConfig {
    fn default() -> Self {
        Self {
            spi_channel: 0,
            bitrate: 1_000_000,
            channel: 0,
            gain: 1,
            reference_voltage: 2.048,
            scaling: Scaling::default(),
        }
    }
}

/// I2C relay board channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bus: u32,
    pub address: u8,

    /// Relay channel; doubles as the register written.
    pub channel: u8,

    /// Turn off automatically this many seconds after turning on.
    pub momentary_secs: Option<f64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bus: 1,
            address: 0x10,
            channel: 1,
            momentary_secs: None,
        }
    }
}

/// I/O expander chip model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpanderChip {
    #[default]
    Mcp23008,
    Mcp23017,
    Mcp23s08,
    Mcp23s17,
}

impl ExpanderChip {
    /// Whether the chip has two 8-bit ports.
    pub fn is_wide(self) -> bool {
        matches!(self, ExpanderChip::Mcp23017 | ExpanderChip::Mcp23s17)
    }

    pub fn is_spi(self) -> bool {
        matches!(self, ExpanderChip::Mcp23s08 | ExpanderChip::Mcp23s17)
    }

    pub fn width(self) -> u8 {
        if self.is_wide() { 16 } else { 8 }
    }
}

/// One bit of an I/O expander.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mcp23xConfig {
    pub chip: ExpanderChip,

    /// I2C bus, or SPI channel for SPI chips.
    pub bus: u32,

    /// I2C address, or hardware address (0..=7) for SPI chips.
    pub address: u8,

    /// SPI bitrate; ignored for I2C chips.
    pub bitrate: u32,
    pub bit: u8,
    pub direction: Direction,
    pub invert: bool,
    pub pull_up: bool,

    /// Interrupt when the input differs from this value instead of on
    /// every change.
    pub compare_value: Option<bool>,

    /// GPIO device relaying this chip's interrupt line.
    pub relay_master: Option<DeviceId>,
    pub momentary_secs: Option<f64>,
}

impl Default for Mcp23xConfig {
    fn default() -> Self {
        Self {
            chip: ExpanderChip::default(),
            bus: 1,
            address: 0x20,
            bitrate: 1_000_000,
            bit: 0,
            direction: Direction::Input,
            invert: false,
            pull_up: false,
            compare_value: None,
            relay_master: None,
            momentary_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PwmConfig {
    pub frequency: f64,
    pub duty_percent: f64,
}

/// Native GPIO line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// GPIO chip; defaults to the chip matching the host model.
    pub chip: Option<u32>,
    pub gpio: u32,
    pub direction: Direction,
    pub pull: PullMode,
    pub invert: bool,

    /// Report edges as they happen instead of only on reads.
    pub callback: bool,
    pub debounce_us: Option<u32>,

    /// Relay interrupts from expander chips wired to this line.
    pub relay_master: bool,

    /// Watchdog armed while the relayed interrupt is asserted.
    pub watchdog_ms: u32,

    /// Run PWM while the output is on.
    pub pwm: Option<PwmConfig>,
    pub momentary_secs: Option<f64>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            chip: None,
            gpio: 0,
            direction: Direction::Input,
            pull: PullMode::None,
            invert: false,
            callback: false,
            debounce_us: None,
            relay_master: false,
            watchdog_ms: DEFAULT_WATCHDOG_MS,
            pwm: None,
            momentary_secs: None,
        }
    }
}

/// Variant-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    Mcp320x(Mcp320xConfig),
    Mcp342x(Mcp342xConfig),
    Mcp482x(Mcp482xConfig),
    Relay(RelayConfig),
    Mcp23x(Mcp23xConfig),
    Gpio(GpioConfig),
}

impl DeviceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceKind::Mcp320x(_) => "mcp320x",
            DeviceKind::Mcp342x(_) => "mcp342x",
            DeviceKind::Mcp482x(_) => "mcp482x",
            DeviceKind::Relay(_) => "relay",
            DeviceKind::Mcp23x(_) => "mcp23x",
            DeviceKind::Gpio(_) => "gpio",
        }
    }
}

/// Configuration of one logical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,

    /// Display name; the id when empty.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub host: HostConfig,

    /// Log every read instead of only changes.
    #[serde(default)]
    pub log_all: bool,

    #[serde(default)]
    pub polling: PollingConfig,

    pub kind: DeviceKind,
}

impl DeviceConfig {
    pub fn new(id: DeviceId, kind: DeviceKind) -> Self {
        Self {
            id,
            name: String::new(),
            host: HostConfig::default(),
            log_all: false,
            polling: PollingConfig::default(),
            kind,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }

    /// Momentary turn-off delay, for variants that support it.
    pub fn momentary(&self) -> Option<Duration> {
        self.momentary_secs().map(secs)
    }

    /// Master this device relays its interrupts through.
    pub fn relay_master(&self) -> Option<&DeviceId> {
        match &self.kind {
            DeviceKind::Mcp23x(expander) if expander.direction == Direction::Input => {
                expander.relay_master.as_ref()
            }
            _ => None,
        }
    }

    /// Whether this device relays interrupts for other devices.
    pub fn is_relay_master(&self) -> bool {
        matches!(&self.kind, DeviceKind::Gpio(gpio) if gpio.relay_master && gpio.direction == Direction::Input)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: String| Err(Error::Config(format!("{}: {}", self.id, what)));

        if self.host.address.trim().is_empty() {
            return invalid("host address is empty".to_string());
        }
        if self.polling.enabled && !non_negative(self.polling.interval_secs) {
            return invalid(format!(
                "poll interval {} is not a duration",
                self.polling.interval_secs
            ));
        }
        if let Some(delay) = self.momentary_secs()
            && !positive(delay)
        {
            return invalid(format!("momentary delay {delay} must be positive"));
        }

        match &self.kind {
            DeviceKind::Mcp320x(adc) => {
                if adc.channel > 7 {
                    return invalid(format!("ADC channel {} out of range 0..=7", adc.channel));
                }
                if !positive(adc.reference_voltage) {
                    return invalid("reference voltage must be positive".to_string());
                }
            }
            DeviceKind::Mcp342x(adc) => {
                if adc.channel > 3 {
                    return invalid(format!("ADC channel {} out of range 0..=3", adc.channel));
                }
                if !matches!(adc.resolution, 12 | 14 | 16 | 18) {
                    return invalid(format!("unsupported resolution {}", adc.resolution));
                }
                if !matches!(adc.gain, 1 | 2 | 4 | 8) {
                    return invalid(format!("unsupported gain {}", adc.gain));
                }
            }
            DeviceKind::Mcp482x(dac) => {
                if dac.channel > 1 {
                    return invalid(format!("DAC channel {} out of range 0..=1", dac.channel));
                }
                if !matches!(dac.gain, 1 | 2) {
                    return invalid(format!("unsupported gain {}", dac.gain));
                }
                if !positive(dac.reference_voltage) {
                    return invalid("reference voltage must be positive".to_string());
                }
            }
            DeviceKind::Relay(_) => {}
            DeviceKind::Mcp23x(expander) => {
                if expander.bit >= expander.chip.width() {
                    return invalid(format!(
                        "bit {} out of range for {:?}",
                        expander.bit, expander.chip
                    ));
                }
                if expander.chip.is_spi() && expander.address > 7 {
                    return invalid(format!(
                        "hardware address {} out of range 0..=7",
                        expander.address
                    ));
                }
                if expander.relay_master.as_ref() == Some(&self.id) {
                    return invalid("device cannot be its own relay master".to_string());
                }
            }
            DeviceKind::Gpio(gpio) => {
                if gpio.relay_master && gpio.direction != Direction::Input {
                    return invalid("relay master must be an input".to_string());
                }
                if let Some(pwm) = &gpio.pwm
                    && !(positive(pwm.frequency) && (0.0..=100.0).contains(&pwm.duty_percent))
                {
                    return invalid("PWM needs a positive frequency and a 0-100% duty".to_string());
                }
            }
        }
        Ok(())
    }

    fn momentary_secs(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::Relay(relay) => relay.momentary_secs,
            DeviceKind::Mcp23x(expander) => expander.momentary_secs,
            DeviceKind::Gpio(gpio) => gpio.momentary_secs,
            _ => None,
        }
    }
}

/// A context configuration plus its devices, as loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFile {
    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl DeviceFile {
    /// Parse and validate a device file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on malformed JSON, invalid settings, or
    /// duplicate device ids.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: DeviceFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid device file: {e}")))?;

        let mut seen = std::collections::HashSet::new();
        for device in &file.devices {
            device.validate()?;
            if !seen.insert(device.id.clone()) {
                return Err(Error::Config(format!("duplicate device id {}", device.id)));
            }
        }
        Ok(file)
    }

    /// Read and parse a device file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`DeviceFile::from_json`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    #[test]
    fn test_parse_device_file() {
        let json = r#"{
            "context": { "poll_period_secs": 0.25 },
            "devices": [
                {
                    "id": "pump",
                    "name": "Pump relay",
                    "kind": { "type": "relay", "address": 16, "momentary_secs": 0.1 }
                },
                {
                    "id": "int",
                    "kind": { "type": "gpio", "gpio": 17, "relay_master": true, "invert": true }
                },
                {
                    "id": "door",
                    "polling": { "enabled": true, "interval_secs": 2.0 },
                    "kind": { "type": "mcp23x", "chip": "mcp23017", "bit": 9, "relay_master": "int" }
                }
            ]
        }"#;

        let file = DeviceFile::from_json(json).unwrap();
        assert_eq!(file.context.poll_period(), Duration::from_millis(250));
        assert_eq!(file.devices.len(), 3);

        let pump = &file.devices[0];
        assert_eq!(pump.display_name(), "Pump relay");
        assert_eq!(pump.host.port, DEFAULT_DAEMON_PORT);
        assert_eq!(pump.momentary(), Some(Duration::from_millis(100)));

        let master = &file.devices[1];
        assert!(master.is_relay_master());
        assert_eq!(master.display_name(), "int");

        let door = &file.devices[2];
        assert_eq!(door.relay_master(), Some(&id("int")));
        assert_eq!(door.polling.interval(), Duration::from_secs(2));
        assert_eq!(door.kind.type_name(), "mcp23x");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{ "devices": [
            { "id": "a", "kind": { "type": "relay" } },
            { "id": "a", "kind": { "type": "relay" } }
        ] }"#;
        let err = DeviceFile::from_json(json).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{ "devices": [ { "id": "a", "kind": { "type": "lcd" } } ] }"#;
        assert!(matches!(DeviceFile::from_json(json), Err(Error::Config(_))));
    }

    #[rstest]
    #[case(DeviceKind::Mcp320x(Mcp320xConfig { channel: 8, ..Default::default() }))]
    #[case(DeviceKind::Mcp342x(Mcp342xConfig { resolution: 10, ..Default::default() }))]
    #[case(DeviceKind::Mcp342x(Mcp342xConfig { gain: 3, ..Default::default() }))]
    #[case(DeviceKind::Mcp482x(Mcp482xConfig { gain: 4, ..Default::default() }))]
    #[case(DeviceKind::Mcp23x(Mcp23xConfig { bit: 8, ..Default::default() }))]
    #[case(DeviceKind::Relay(RelayConfig { momentary_secs: Some(0.0), ..Default::default() }))]
    #[case(DeviceKind::Gpio(GpioConfig { relay_master: true, direction: Direction::Output, ..Default::default() }))]
    fn test_invalid_settings(#[case] kind: DeviceKind) {
        let config = DeviceConfig::new(id("dev"), kind);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_wide_expander_accepts_high_bits() {
        let config = DeviceConfig::new(
            id("dev"),
            DeviceKind::Mcp23x(Mcp23xConfig {
                chip: ExpanderChip::Mcp23s17,
                address: 3,
                bit: 15,
                ..Default::default()
            }),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_expander_has_no_relay_master() {
        let config = DeviceConfig::new(
            id("dev"),
            DeviceKind::Mcp23x(Mcp23xConfig {
                direction: Direction::Output,
                relay_master: Some(id("int")),
                ..Default::default()
            }),
        );
        assert_eq!(config.relay_master(), None);
    }
}
