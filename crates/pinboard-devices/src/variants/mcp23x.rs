//! One bit of an MCP23008/MCP23017 (I2C) or MCP23S08/MCP23S17 (SPI) I/O
//! expander.
//!
//! Several devices usually share one chip, each owning one bit of the same
//! physical registers. Every change is a read-modify-write of the device's
//! own bit, and all such sequences are serialized so concurrent devices
//! never lose each other's bits.
//!
//! Inputs wired to a relay master report interrupts: the master's edge
//! callback asks each registered source whether its INTF bit is set, and the
//! first source that claims the interrupt reads the captured value.

use std::sync::{Arc, Mutex};

use pinboard_core::Result;
use pinboard_daemon::{DaemonConnection, Handle};
use tracing::{debug, warn};

use super::{BusResources, Driver, WriteOutcome, switch_value};
use crate::config::{Direction, Mcp23xConfig};
use crate::lock;
use crate::state::{LogMode, StateSink, update_on_off};

/// Serializes register read-modify-write across all expander devices.
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

/// IOCON address with BANK=1 (and on 8-bit chips).
const IOCON_BANK1: u8 = 0x05;
/// IOCON address with BANK=0 on 16-bit chips.
const IOCON_BANK0: u8 = 0x0A;
/// INTA and INTB drive the same line.
const IOCON_MIRROR: u8 = 0x40;
/// Hardware address pins enabled on SPI chips.
const IOCON_HAEN: u8 = 0x08;

const SPI_OPCODE: u8 = 0x40;
const SPI_READ: u8 = 0x01;

/// Expander registers in chip order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Iodir = 0,
    Ipol = 1,
    Gpinten = 2,
    Defval = 3,
    Intcon = 4,
    Iocon = 5,
    Gppu = 6,
    Intf = 7,
    Intcap = 8,
    Gpio = 9,
    Olat = 10,
}

impl Register {
    /// Address of this register for `port`, with 16-bit chips in BANK=0
    /// layout (A and B registers interleaved).
    #[must_use]
    pub fn address(self, wide: bool, port: u8) -> u8 {
        let index = self as u8;
        if wide { index * 2 + port } else { index }
    }
}

#[derive(Clone, Copy)]
enum Bus {
    I2c,
    Spi { hw_address: u8 },
}

pub struct Mcp23x {
    connection: Arc<dyn DaemonConnection>,
    handle: Handle,
    bus: Bus,
    wide: bool,
    port: u8,
    mask: u8,
    direction: Direction,
    state: Option<bool>,
    interrupt_enabled: bool,
}

impl Mcp23x {
    /// Claim one bit and configure it. Interrupts stay disabled until
    /// [`enable_interrupt`](Self::enable_interrupt).
    pub fn open(resources: &mut BusResources<'_>, config: &Mcp23xConfig) -> Result<Self> {
        let wide = config.chip.is_wide();
        let (handle, bus) = if config.chip.is_spi() {
            let bus = Bus::Spi {
                hw_address: config.address & 0x07,
            };
            let handle = resources.spi_with_setup(config.bus, config.bitrate, |c, handle| {
                configure_chip(c, handle, bus, wide)
            })?;
            (handle, bus)
        } else {
            let handle = resources.i2c_with_setup(config.bus, config.address, |c, handle| {
                configure_chip(c, handle, Bus::I2c, wide)
            })?;
            (handle, Bus::I2c)
        };

        let expander = Self {
            connection: resources.connection(),
            handle,
            bus,
            wide,
            port: config.bit / 8,
            mask: 1 << (config.bit % 8),
            direction: config.direction,
            state: None,
            interrupt_enabled: false,
        };

        match config.direction {
            Direction::Input => {
                expander.update_register(Register::Iodir, true)?;
                expander.update_register(Register::Ipol, config.invert)?;
                expander.update_register(Register::Gppu, config.pull_up)?;
                match config.compare_value {
                    Some(compare) => {
                        expander.update_register(Register::Defval, compare)?;
                        expander.update_register(Register::Intcon, true)?;
                    }
                    None => {
                        expander.update_register(Register::Intcon, false)?;
                    }
                }
            }
            Direction::Output => {
                expander.update_register(Register::Iodir, false)?;
            }
        }
        Ok(expander)
    }

    fn read_register(&self, address: u8) -> Result<u8> {
        read_raw(self.connection.as_ref(), self.handle, self.bus, address)
    }

    fn write_register(&self, address: u8, value: u8) -> Result<()> {
        write_raw(self.connection.as_ref(), self.handle, self.bus, address, value)
    }

    fn address(&self, register: Register) -> u8 {
        register.address(self.wide, self.port)
    }

    fn read_reg(&self, register: Register) -> Result<u8> {
        self.read_register(self.address(register))
    }

    /// Set or clear this device's bit in `register`, writing only if the
    /// register value changes. Returns whether it was written.
    fn update_register(&self, register: Register, on: bool) -> Result<bool> {
        let _guard = lock(&UPDATE_LOCK);
        let address = self.address(register);
        let current = self.read_register(address)?;
        let value = if on {
            current | self.mask
        } else {
            current & !self.mask
        };
        if value == current {
            return Ok(false);
        }
        self.write_register(address, value)?;
        Ok(true)
    }

    pub fn enable_interrupt(&mut self) -> Result<()> {
        self.update_register(Register::Gpinten, true)?;
        self.interrupt_enabled = true;
        Ok(())
    }

    /// Claim a relayed interrupt if this device's flag is set.
    ///
    /// Reading INTCAP clears the chip's interrupt. Other flags set at the
    /// same time belong to devices that will not be asked, so they are
    /// reported as lost.
    pub fn interrupt(&mut self, sink: &StateSink<'_>) -> Result<bool> {
        let flags = self.read_reg(Register::Intf)?;
        if flags & self.mask == 0 {
            return Ok(false);
        }

        let captured = self.read_reg(Register::Intcap)?;
        update_on_off(sink, &mut self.state, captured & self.mask != 0, LogMode::Suppressed);

        let others = flags & !self.mask;
        if others != 0 {
            warn!(
                "\"{}\" lost interrupt: flags 0b{:08b} set with ours",
                sink.name, others
            );
        }
        Ok(true)
    }

    /// Clear a stuck interrupt by reading the port.
    pub fn reset_interrupt(&mut self, sink: &StateSink<'_>) -> Result<()> {
        let port = self.read_reg(Register::Gpio)?;
        debug!("\"{}\" interrupt reset, port 0b{:08b}", sink.name, port);
        update_on_off(sink, &mut self.state, port & self.mask != 0, LogMode::Changes);
        Ok(())
    }
}

fn read_raw(connection: &dyn DaemonConnection, handle: Handle, bus: Bus, address: u8) -> Result<u8> {
    match bus {
        Bus::I2c => Ok(connection.i2c_read_byte_data(handle, address)?),
        Bus::Spi { hw_address } => {
            let opcode = SPI_OPCODE | (hw_address << 1) | SPI_READ;
            let reply = connection.spi_xfer(handle, &[opcode, address, 0x00])?;
            Ok(reply.get(2).copied().unwrap_or_default())
        }
    }
}

fn write_raw(
    connection: &dyn DaemonConnection,
    handle: Handle,
    bus: Bus,
    address: u8,
    value: u8,
) -> Result<()> {
    match bus {
        Bus::I2c => Ok(connection.i2c_write_byte_data(handle, address, value)?),
        Bus::Spi { hw_address } => {
            let opcode = SPI_OPCODE | (hw_address << 1);
            connection.spi_xfer(handle, &[opcode, address, value])?;
            Ok(())
        }
    }
}

/// Write the chip configuration when its bus handle is first opened.
///
/// The bank layout of a 16-bit chip is unknown, so the value goes to IOCON's
/// address in both layouts. The chip ends up in BANK=0, where the first
/// address is GPINTENB; no device holds the chip yet, so it is cleared.
fn configure_chip(
    connection: &dyn DaemonConnection,
    handle: Handle,
    bus: Bus,
    wide: bool,
) -> Result<()> {
    let _guard = lock(&UPDATE_LOCK);
    let mut iocon = 0;
    if wide {
        iocon |= IOCON_MIRROR;
    }
    if matches!(bus, Bus::Spi { .. }) {
        iocon |= IOCON_HAEN;
    }

    write_raw(connection, handle, bus, IOCON_BANK1, iocon)?;
    if wide {
        write_raw(connection, handle, bus, IOCON_BANK0, iocon)?;
        write_raw(connection, handle, bus, Register::Gpinten.address(true, 1), 0)?;
    }
    debug!("Configured expander, IOCON 0x{:02x}", iocon);
    Ok(())
}

impl Driver for Mcp23x {
    fn read(&mut self, sink: &StateSink<'_>, mode: LogMode) -> Result<()> {
        let register = match self.direction {
            Direction::Input => Register::Gpio,
            Direction::Output => Register::Olat,
        };
        let value = self.read_reg(register)?;
        update_on_off(sink, &mut self.state, value & self.mask != 0, mode);
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

        self.update_register(Register::Olat, on)?;
        update_on_off(sink, &mut self.state, on, mode);
        Ok(if on { WriteOutcome::On } else { WriteOutcome::Off })
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.interrupt_enabled {
            self.interrupt_enabled = false;
            self.update_register(Register::Gpinten, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpanderChip;
    use crate::variants::testing::Bench;
    use rstest::rstest;

    fn expander(bench: &Bench, config: Mcp23xConfig) -> Mcp23x {
        Mcp23x::open(&mut bench.resources(), &config).unwrap()
    }

    fn mcp23017(bit: u8, direction: Direction) -> Mcp23xConfig {
        Mcp23xConfig {
            chip: ExpanderChip::Mcp23017,
            bit,
            direction,
            ..Mcp23xConfig::default()
        }
    }

    #[rstest]
    #[case(Register::Iodir, false, 0, 0x00)]
    #[case(Register::Olat, false, 0, 0x0A)]
    #[case(Register::Iodir, true, 1, 0x01)]
    #[case(Register::Intf, true, 0, 0x0E)]
    #[case(Register::Intcap, true, 1, 0x11)]
    #[case(Register::Gpio, true, 1, 0x13)]
    #[case(Register::Olat, true, 1, 0x15)]
    fn test_register_address(
        #[case] register: Register,
        #[case] wide: bool,
        #[case] port: u8,
        #[case] expected: u8,
    ) {
        assert_eq!(register.address(wide, port), expected);
    }

    #[test]
    fn test_input_setup_on_port_b() {
        let bench = Bench::new();
        let config = Mcp23xConfig {
            invert: true,
            pull_up: true,
            ..mcp23017(9, Direction::Input)
        };
        expander(&bench, config);

        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x01), 0x02); // IODIRB
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x03), 0x02); // IPOLB
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x0D), 0x02); // GPPUB
        assert_eq!(bench.daemon.i2c_writes(1, 0x20)[0], vec![IOCON_BANK1, IOCON_MIRROR]);
        assert_eq!(bench.daemon.i2c_register(1, 0x20, IOCON_BANK0), IOCON_MIRROR);
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x04), 0x00); // GPINTENA untouched
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x05), 0x00); // GPINTENB cleared
    }

    #[test]
    fn test_chip_configured_once_per_handle() {
        let bench = Bench::new();
        let mut resources = bench.resources();
        let mut first = Mcp23x::open(&mut resources, &mcp23017(8, Direction::Input)).unwrap();
        first.enable_interrupt().unwrap();
        let mut second = Mcp23x::open(&mut resources, &mcp23017(9, Direction::Input)).unwrap();
        second.enable_interrupt().unwrap();

        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x05), 0b11); // GPINTENB
        let iocon_writes = bench
            .daemon
            .i2c_writes(1, 0x20)
            .iter()
            .filter(|write| write[0] == IOCON_BANK0)
            .count();
        assert_eq!(iocon_writes, 1);
    }

    #[test]
    fn test_failed_configuration_releases_handle() {
        let bench = Bench::new();
        bench.daemon.set_i2c_fault(1, 0x20, true);
        let mut resources = bench.resources();
        assert!(Mcp23x::open(&mut resources, &mcp23017(0, Direction::Input)).is_err());
        assert_eq!(bench.daemon.open_handles(), 0);
    }

    #[test]
    fn test_devices_share_register_without_disturbing() {
        let bench = Bench::new();
        let mut first = expander(&bench, mcp23017(0, Direction::Output));
        let mut second = expander(&bench, mcp23017(1, Direction::Output));
        let sink = bench.sink();

        first.write(&sink, 1.0, LogMode::Changes).unwrap();
        second.write(&sink, 1.0, LogMode::Changes).unwrap();
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x14), 0b11);

        first.write(&sink, 0.0, LogMode::Changes).unwrap();
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x14), 0b10);
    }

    #[test]
    fn test_unchanged_register_is_not_written() {
        let bench = Bench::new();
        let mut output = expander(&bench, mcp23017(0, Direction::Output));
        let sink = bench.sink();

        output.write(&sink, 1.0, LogMode::Changes).unwrap();
        let writes = bench.daemon.i2c_writes(1, 0x20).len();
        output.write(&sink, 1.0, LogMode::Changes).unwrap();
        assert_eq!(bench.daemon.i2c_writes(1, 0x20).len(), writes);
    }

    #[test]
    fn test_write_to_input_is_ignored() {
        let bench = Bench::new();
        let mut input = expander(&bench, mcp23017(0, Direction::Input));
        let outcome = input.write(&bench.sink(), 1.0, LogMode::Changes).unwrap();
        assert_eq!(outcome, WriteOutcome::Ignored);
    }

    #[test]
    fn test_interrupt_claims_only_own_flag() {
        let bench = Bench::new();
        let mut first = expander(&bench, mcp23017(0, Direction::Input));
        let mut second = expander(&bench, mcp23017(2, Direction::Input));
        first.enable_interrupt().unwrap();
        second.enable_interrupt().unwrap();
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x04), 0b101);

        bench.daemon.set_i2c_register(1, 0x20, 0x0E, 0b100); // INTFA
        bench.daemon.set_i2c_register(1, 0x20, 0x10, 0b100); // INTCAPA
        let sink = bench.sink();

        assert!(!first.interrupt(&sink).unwrap());
        assert!(bench.reporter.history().is_empty());
        assert!(second.interrupt(&sink).unwrap());
        assert_eq!(bench.reporter.last_on_off(&bench.device), Some(true));
    }

    #[test]
    fn test_shutdown_disables_interrupt() {
        let bench = Bench::new();
        let mut input = expander(&bench, mcp23017(3, Direction::Input));
        input.enable_interrupt().unwrap();
        input.shutdown().unwrap();
        assert_eq!(bench.daemon.i2c_register(1, 0x20, 0x04), 0);
    }

    #[test]
    fn test_spi_chip_uses_hardware_address() {
        let bench = Bench::new();
        bench.daemon.emulate_spi_expander(0);
        let config = Mcp23xConfig {
            chip: ExpanderChip::Mcp23s17,
            bus: 0,
            address: 3,
            bit: 4,
            direction: Direction::Output,
            ..Mcp23xConfig::default()
        };
        let mut output = expander(&bench, config);

        output.write(&bench.sink(), 1.0, LogMode::Changes).unwrap();

        assert_eq!(bench.daemon.spi_register(0, 3, 0x0A), IOCON_MIRROR | IOCON_HAEN);
        assert_eq!(bench.daemon.spi_register(0, 3, 0x14), 0x10);
        assert_eq!(bench.daemon.spi_writes(0)[0][0], 0x46);
    }
}
