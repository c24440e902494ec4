use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical device identifier assigned by the host registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device ID with validation.
    ///
    /// The identifier is trimmed before validation.
    ///
    /// # Errors
    /// Returns `Error::Config` if the identifier is empty or contains whitespace.
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::Config("Device ID must not be empty".to_string()));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!(
                "Device ID must not contain whitespace, got {id:?}"
            )));
        }
        Ok(DeviceId(id.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DeviceId::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        DeviceId::new(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Discriminator of a daemon-side bus handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKey {
    /// A GPIO chip set (gpiochipN).
    GpioChip(u32),

    /// One I2C device on one bus.
    I2c { bus: u32, address: u8 },

    /// One SPI channel opened at one bit rate.
    Spi { channel: u32, bitrate: u32 },
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandleKey::GpioChip(chip) => write!(f, "gpiochip{chip}"),
            HandleKey::I2c { bus, address } => write!(f, "i2c{bus}-0x{address:02x}"),
            HandleKey::Spi { channel, bitrate } => write!(f, "spi{channel}-{bitrate}"),
        }
    }
}

/// Identifier of a pooled daemon resource.
///
/// Identifiers are hierarchical: a handle id extends the id of the
/// connection it was opened on, so `pi:8889/i2c1-0x20` belongs to `pi:8889`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    connection: String,
    handle: Option<HandleKey>,
}

impl ResourceId {
    /// Identifier of the connection to one daemon instance.
    #[must_use]
    pub fn connection(host: &str, port: u16) -> Self {
        Self {
            connection: format!("{host}:{port}"),
            handle: None,
        }
    }

    /// Identifier of a handle opened on this connection.
    #[must_use]
    pub fn handle(&self, key: HandleKey) -> Self {
        Self {
            connection: self.connection.clone(),
            handle: Some(key),
        }
    }

    #[must_use]
    pub fn gpio_chip(&self, chip: u32) -> Self {
        self.handle(HandleKey::GpioChip(chip))
    }

    #[must_use]
    pub fn i2c(&self, bus: u32, address: u8) -> Self {
        self.handle(HandleKey::I2c { bus, address })
    }

    #[must_use]
    pub fn spi(&self, channel: u32, bitrate: u32) -> Self {
        self.handle(HandleKey::Spi { channel, bitrate })
    }

    /// True for connection ids, false for handle ids.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        self.handle.is_none()
    }

    #[must_use]
    pub fn handle_key(&self) -> Option<HandleKey> {
        self.handle
    }

    /// The connection id this resource belongs to.
    #[must_use]
    pub fn connection_id(&self) -> ResourceId {
        Self {
            connection: self.connection.clone(),
            handle: None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.handle {
            None => f.write_str(&self.connection),
            Some(key) => write!(f, "{}/{}", self.connection, key),
        }
    }
}

/// Error taxonomy used when a failure crosses a device boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Daemon unreachable or host identification failed.
    Connection,
    /// Variant construction or configuration failed.
    Start,
    Read,
    Write,
    Interrupt,
    /// Failure while stopping; logged only, never escalated.
    Stop,
}

impl ErrorKind {
    /// Name used for trigger events and error-state tags.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connectionError",
            ErrorKind::Start => "startError",
            ErrorKind::Read => "readError",
            ErrorKind::Write => "writeError",
            ErrorKind::Interrupt => "interruptError",
            ErrorKind::Stop => "stopError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("relay-1", "relay-1")]
    #[case("  adc7 ", "adc7")]
    #[case("1234567", "1234567")]
    fn test_device_id_valid(#[case] input: &str, #[case] expected: &str) {
        let id: DeviceId = input.parse().unwrap();
        assert_eq!(id.as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("two words")]
    fn test_device_id_invalid(#[case] input: &str) {
        assert!(DeviceId::new(input).is_err());
    }

    #[test]
    fn test_device_id_serde_validates() {
        let id: DeviceId = serde_json::from_str("\"pump\"").unwrap();
        assert_eq!(id.to_string(), "pump");
        assert!(serde_json::from_str::<DeviceId>("\"\"").is_err());
    }

    #[test]
    fn test_resource_ids_are_hierarchical() {
        let conn = ResourceId::connection("pi4", 8889);
        assert_eq!(conn.to_string(), "pi4:8889");
        assert!(conn.is_connection());

        let i2c = conn.i2c(1, 0x20);
        assert_eq!(i2c.to_string(), "pi4:8889/i2c1-0x20");
        assert!(!i2c.is_connection());
        assert_eq!(i2c.connection_id(), conn);

        assert_eq!(conn.gpio_chip(4).to_string(), "pi4:8889/gpiochip4");
        assert_eq!(conn.spi(0, 1_000_000).to_string(), "pi4:8889/spi0-1000000");
    }

    #[test]
    fn test_handle_namespace_distinct_from_connection() {
        let conn = ResourceId::connection("pi4", 8889);
        assert_ne!(conn, conn.gpio_chip(0));
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::Connection.as_str(), "connectionError");
        assert_eq!(ErrorKind::Interrupt.to_string(), "interruptError");
    }
}
