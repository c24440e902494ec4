//! Mock daemon implementation for testing and development.
//!
//! [`MockDaemon`] simulates a remote GPIO daemon and the chips wired to it.
//! It keeps a 256-byte register file per I2C device, scripted reply queues
//! for raw I2C reads and SPI transfers, GPIO line levels, and a registry of
//! edge callbacks that tests fire explicitly.
//!
//! Cloning a `MockDaemon` yields another view of the same simulated host, so
//! a test can hand one clone to the device layer as its connector and keep
//! another to drive and inspect the hardware.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use pinboard_daemon::mock::MockDaemon;
//! use pinboard_daemon::{DaemonConnector, Edge, EdgeEvent, PullMode};
//!
//! # fn main() -> pinboard_daemon::Result<()> {
//! let daemon = MockDaemon::new();
//! let connection = daemon.open("pi", 8889)?;
//! let chip = connection.gpiochip_open(0)?;
//! connection.gpio_claim_input(chip, 17, PullMode::Up)?;
//!
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! connection.callback(chip, 17, Edge::Both, Arc::new(move |_event: EdgeEvent| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! }))?;
//!
//! daemon.fire_edge(17, false);
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pinboard_core::HandleKey;
use tracing::trace;

use crate::traits::{DaemonConnection, DaemonConnector};
use crate::types::{CallbackId, Edge, EdgeCallback, EdgeEvent, EdgeLevel, Handle, PullMode};
use crate::{DaemonError, Result};

/// Model string reported when no other model was configured.
const DEFAULT_MODEL: &str = "Raspberry Pi 4 Model B Rev 1.5";

/// Simulated state of one GPIO line.
#[derive(Debug, Clone, Default)]
struct PinState {
    level: bool,
    output: bool,
    pull: PullMode,
    debounce_us: u32,
    watchdog_us: u32,
    pwm: Option<(f64, f64)>,
}

struct RegisteredCallback {
    chip: u32,
    gpio: u32,
    edge: Edge,
    callback: EdgeCallback,
}

struct MockState {
    reachable: bool,
    accepting: bool,
    model: Option<String>,
    next_handle: i32,
    next_callback: u64,
    connections_opened: usize,
    connections_closed: usize,
    handles: HashMap<Handle, HandleKey>,
    opened: HashMap<HandleKey, usize>,
    closed: HashMap<HandleKey, usize>,
    i2c_registers: HashMap<(u32, u8), [u8; 256]>,
    i2c_reads: HashMap<(u32, u8), VecDeque<Vec<u8>>>,
    i2c_writes: HashMap<(u32, u8), Vec<Vec<u8>>>,
    i2c_faults: HashSet<(u32, u8)>,
    spi_replies: HashMap<u32, VecDeque<Vec<u8>>>,
    spi_writes: HashMap<u32, Vec<Vec<u8>>>,
    spi_expanders: HashSet<u32>,
    spi_registers: HashMap<(u32, u8), [u8; 256]>,
    pins: HashMap<u32, PinState>,
    gpio_faults: HashSet<u32>,
    callbacks: HashMap<CallbackId, RegisteredCallback>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            reachable: true,
            accepting: true,
            model: Some(DEFAULT_MODEL.to_string()),
            next_handle: 1,
            next_callback: 1,
            connections_opened: 0,
            connections_closed: 0,
            handles: HashMap::new(),
            opened: HashMap::new(),
            closed: HashMap::new(),
            i2c_registers: HashMap::new(),
            i2c_reads: HashMap::new(),
            i2c_writes: HashMap::new(),
            i2c_faults: HashSet::new(),
            spi_replies: HashMap::new(),
            spi_writes: HashMap::new(),
            spi_expanders: HashSet::new(),
            spi_registers: HashMap::new(),
            pins: HashMap::new(),
            gpio_faults: HashSet::new(),
            callbacks: HashMap::new(),
        }
    }
}

impl MockState {
    fn allocate(&mut self, key: HandleKey) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, key);
        *self.opened.entry(key).or_default() += 1;
        handle
    }

    fn release(&mut self, handle: Handle) -> Result<()> {
        let key = self
            .handles
            .remove(&handle)
            .ok_or(DaemonError::BadHandle { handle: handle.0 })?;
        *self.closed.entry(key).or_default() += 1;
        Ok(())
    }

    fn key(&self, handle: Handle) -> Result<HandleKey> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or(DaemonError::BadHandle { handle: handle.0 })
    }

    fn i2c_device(&self, handle: Handle) -> Result<(u32, u8)> {
        match self.key(handle)? {
            HandleKey::I2c { bus, address } => {
                if self.i2c_faults.contains(&(bus, address)) {
                    return Err(DaemonError::rejected(format!(
                        "I2C device 0x{address:02x} on bus {bus} not responding"
                    )));
                }
                Ok((bus, address))
            }
            _ => Err(DaemonError::BadHandle { handle: handle.0 }),
        }
    }

    fn spi_channel(&self, handle: Handle) -> Result<u32> {
        match self.key(handle)? {
            HandleKey::Spi { channel, .. } => Ok(channel),
            _ => Err(DaemonError::BadHandle { handle: handle.0 }),
        }
    }

    fn pin(&mut self, handle: Handle, gpio: u32) -> Result<&mut PinState> {
        match self.key(handle)? {
            HandleKey::GpioChip(_) => {
                if self.gpio_faults.contains(&gpio) {
                    return Err(DaemonError::rejected(format!("GPIO {gpio} busy")));
                }
                Ok(self.pins.entry(gpio).or_default())
            }
            _ => Err(DaemonError::BadHandle { handle: handle.0 }),
        }
    }
}

/// Simulated daemon host.
///
/// Implements [`DaemonConnector`]; every opened [`MockConnection`] shares
/// this daemon's state.
#[derive(Clone, Default)]
pub struct MockDaemon {
    state: Arc<Mutex<MockState>>,
}

impl MockDaemon {
    /// Create a reachable daemon reporting a Raspberry Pi 4 model string.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Host configuration
    // ------------------------------------------------------------------

    /// Make subsequent `open` calls fail as if the host were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// When false, `open` succeeds but returns a connection that is not live.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Set the model string served for the host model file. `None` makes
    /// the file unreadable.
    pub fn set_model(&self, model: Option<&str>) {
        self.lock().model = model.map(str::to_string);
    }

    // ------------------------------------------------------------------
    // I2C
    // ------------------------------------------------------------------

    pub fn set_i2c_register(&self, bus: u32, address: u8, register: u8, value: u8) {
        self.lock()
            .i2c_registers
            .entry((bus, address))
            .or_insert([0; 256])[usize::from(register)] = value;
    }

    pub fn i2c_register(&self, bus: u32, address: u8, register: u8) -> u8 {
        self.lock()
            .i2c_registers
            .get(&(bus, address))
            .map_or(0, |regs| regs[usize::from(register)])
    }

    /// Queue the reply of the next raw read from an I2C device.
    pub fn queue_i2c_read(&self, bus: u32, address: u8, bytes: &[u8]) {
        self.lock()
            .i2c_reads
            .entry((bus, address))
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Every write made to an I2C device, byte-data writes as `[register, value]`.
    pub fn i2c_writes(&self, bus: u32, address: u8) -> Vec<Vec<u8>> {
        self.lock()
            .i2c_writes
            .get(&(bus, address))
            .cloned()
            .unwrap_or_default()
    }

    /// Make every transfer to an I2C device fail.
    pub fn set_i2c_fault(&self, bus: u32, address: u8, faulty: bool) {
        let mut state = self.lock();
        if faulty {
            state.i2c_faults.insert((bus, address));
        } else {
            state.i2c_faults.remove(&(bus, address));
        }
    }

    // ------------------------------------------------------------------
    // SPI
    // ------------------------------------------------------------------

    /// Queue the reply of the next transfer on an SPI channel.
    pub fn queue_spi_reply(&self, channel: u32, bytes: &[u8]) {
        self.lock()
            .spi_replies
            .entry(channel)
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Every buffer transmitted on an SPI channel.
    pub fn spi_writes(&self, channel: u32) -> Vec<Vec<u8>> {
        self.lock()
            .spi_writes
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Serve register-access opcodes on `channel` from per-address register
    /// files, like an SPI I/O expander with hardware addressing.
    pub fn emulate_spi_expander(&self, channel: u32) {
        self.lock().spi_expanders.insert(channel);
    }

    pub fn spi_register(&self, channel: u32, hw_address: u8, register: u8) -> u8 {
        self.lock()
            .spi_registers
            .get(&(channel, hw_address))
            .map_or(0, |regs| regs[usize::from(register)])
    }

    pub fn set_spi_register(&self, channel: u32, hw_address: u8, register: u8, value: u8) {
        self.lock()
            .spi_registers
            .entry((channel, hw_address))
            .or_insert([0; 256])[usize::from(register)] = value;
    }

    // ------------------------------------------------------------------
    // GPIO
    // ------------------------------------------------------------------

    /// Set a line level without notifying callbacks.
    pub fn set_gpio_level(&self, gpio: u32, level: bool) {
        self.lock().pins.entry(gpio).or_default().level = level;
    }

    pub fn gpio_level(&self, gpio: u32) -> bool {
        self.lock().pins.get(&gpio).is_some_and(|pin| pin.level)
    }

    pub fn gpio_is_output(&self, gpio: u32) -> bool {
        self.lock().pins.get(&gpio).is_some_and(|pin| pin.output)
    }

    pub fn gpio_pull(&self, gpio: u32) -> PullMode {
        self.lock()
            .pins
            .get(&gpio)
            .map_or(PullMode::None, |pin| pin.pull)
    }

    /// Make every operation on a line fail.
    pub fn set_gpio_fault(&self, gpio: u32, faulty: bool) {
        let mut state = self.lock();
        if faulty {
            state.gpio_faults.insert(gpio);
        } else {
            state.gpio_faults.remove(&gpio);
        }
    }

    pub fn debounce(&self, gpio: u32) -> u32 {
        self.lock().pins.get(&gpio).map_or(0, |pin| pin.debounce_us)
    }

    /// Armed watchdog window in microseconds, zero when disarmed.
    pub fn watchdog(&self, gpio: u32) -> u32 {
        self.lock().pins.get(&gpio).map_or(0, |pin| pin.watchdog_us)
    }

    /// Active PWM as `(frequency, duty_percent)`.
    pub fn pwm(&self, gpio: u32) -> Option<(f64, f64)> {
        self.lock().pins.get(&gpio).and_then(|pin| pin.pwm)
    }

    pub fn callback_count(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Drop every registered callback, as a restarted daemon would.
    pub fn forget_callbacks(&self) {
        self.lock().callbacks.clear();
    }

    /// Drive a line to `level` and deliver the edge to matching callbacks.
    ///
    /// Callbacks run on the calling thread after the state lock is
    /// released, so they may call back into the daemon. Returns the number
    /// of callbacks invoked.
    pub fn fire_edge(&self, gpio: u32, level: bool) -> usize {
        let targets = {
            let mut state = self.lock();
            state.pins.entry(gpio).or_default().level = level;
            Self::callbacks_for(&state, gpio, |edge| edge.matches(level))
        };
        Self::deliver(&targets, gpio, EdgeLevel::from(level))
    }

    /// Deliver a watchdog timeout for a line to all of its callbacks.
    pub fn fire_watchdog(&self, gpio: u32) -> usize {
        let targets = {
            let state = self.lock();
            Self::callbacks_for(&state, gpio, |_| true)
        };
        Self::deliver(&targets, gpio, EdgeLevel::WatchdogTimeout)
    }

    fn callbacks_for(
        state: &MockState,
        gpio: u32,
        accept: impl Fn(Edge) -> bool,
    ) -> Vec<(u32, EdgeCallback)> {
        state
            .callbacks
            .values()
            .filter(|registered| registered.gpio == gpio && accept(registered.edge))
            .map(|registered| (registered.chip, Arc::clone(&registered.callback)))
            .collect()
    }

    fn deliver(targets: &[(u32, EdgeCallback)], gpio: u32, level: EdgeLevel) -> usize {
        for (chip, callback) in targets {
            callback(EdgeEvent {
                chip: *chip,
                gpio,
                level,
                timestamp: chrono::Utc::now(),
            });
        }
        targets.len()
    }

    // ------------------------------------------------------------------
    // Resource accounting
    // ------------------------------------------------------------------

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.lock().connections_closed
    }

    /// Number of times a handle for `key` was opened.
    pub fn open_count(&self, key: HandleKey) -> usize {
        self.lock().opened.get(&key).copied().unwrap_or(0)
    }

    /// Number of times a handle for `key` was closed.
    pub fn close_count(&self, key: HandleKey) -> usize {
        self.lock().closed.get(&key).copied().unwrap_or(0)
    }

    /// Number of handles currently open across all connections.
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }
}

impl DaemonConnector for MockDaemon {
    fn open(&self, host: &str, port: u16) -> Result<Arc<dyn DaemonConnection>> {
        let address = format!("{host}:{port}");
        let accepting = {
            let mut state = self.lock();
            if !state.reachable {
                return Err(DaemonError::unreachable(address));
            }
            state.connections_opened += 1;
            state.accepting
        };
        trace!("Mock daemon accepted connection from {}", address);
        Ok(Arc::new(MockConnection {
            daemon: self.clone(),
            address,
            live: AtomicBool::new(accepting),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One session with a [`MockDaemon`].
pub struct MockConnection {
    daemon: MockDaemon,
    address: String,
    live: AtomicBool,
    closed: AtomicBool,
}

impl MockConnection {
    /// Address this connection was opened with.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(DaemonError::Closed);
        }
        Ok(self.daemon.lock())
    }
}

impl DaemonConnection for MockConnection {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DaemonError::Closed);
        }
        self.live.store(false, Ordering::SeqCst);
        self.daemon.lock().connections_closed += 1;
        Ok(())
    }

    fn file_read(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.state()?;
        match (&state.model, path) {
            (Some(model), pinboard_core::constants::HOST_MODEL_PATH) => {
                let mut bytes = model.as_bytes().to_vec();
                bytes.push(0);
                Ok(bytes)
            }
            _ => Err(DaemonError::rejected(format!("cannot read {path}"))),
        }
    }

    fn gpiochip_open(&self, chip: u32) -> Result<Handle> {
        Ok(self.state()?.allocate(HandleKey::GpioChip(chip)))
    }

    fn gpiochip_close(&self, handle: Handle) -> Result<()> {
        self.state()?.release(handle)
    }

    fn gpio_claim_input(&self, handle: Handle, gpio: u32, pull: PullMode) -> Result<()> {
        let mut state = self.state()?;
        let pin = state.pin(handle, gpio)?;
        pin.output = false;
        pin.pull = pull;
        Ok(())
    }

    fn gpio_claim_output(&self, handle: Handle, gpio: u32, level: bool) -> Result<()> {
        let mut state = self.state()?;
        let pin = state.pin(handle, gpio)?;
        pin.output = true;
        pin.level = level;
        Ok(())
    }

    fn gpio_read(&self, handle: Handle, gpio: u32) -> Result<bool> {
        let mut state = self.state()?;
        Ok(state.pin(handle, gpio)?.level)
    }

    fn gpio_write(&self, handle: Handle, gpio: u32, level: bool) -> Result<()> {
        let mut state = self.state()?;
        let pin = state.pin(handle, gpio)?;
        if !pin.output {
            return Err(DaemonError::rejected(format!("GPIO {gpio} is not an output")));
        }
        pin.level = level;
        Ok(())
    }

    fn gpio_set_debounce(&self, handle: Handle, gpio: u32, micros: u32) -> Result<()> {
        let mut state = self.state()?;
        state.pin(handle, gpio)?.debounce_us = micros;
        Ok(())
    }

    fn gpio_set_watchdog(&self, handle: Handle, gpio: u32, micros: u32) -> Result<()> {
        let mut state = self.state()?;
        state.pin(handle, gpio)?.watchdog_us = micros;
        Ok(())
    }

    fn tx_pwm(&self, handle: Handle, gpio: u32, frequency: f64, duty_percent: f64) -> Result<()> {
        let mut state = self.state()?;
        let pin = state.pin(handle, gpio)?;
        if frequency <= 0.0 || duty_percent <= 0.0 {
            pin.pwm = None;
            pin.level = false;
        } else {
            pin.pwm = Some((frequency, duty_percent));
            pin.level = true;
        }
        Ok(())
    }

    fn callback(
        &self,
        handle: Handle,
        gpio: u32,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<CallbackId> {
        let mut state = self.state()?;
        let chip = match state.key(handle)? {
            HandleKey::GpioChip(chip) => chip,
            _ => return Err(DaemonError::BadHandle { handle: handle.0 }),
        };
        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        state.callbacks.insert(
            id,
            RegisteredCallback {
                chip,
                gpio,
                edge,
                callback,
            },
        );
        Ok(id)
    }

    fn cancel_callback(&self, id: CallbackId) -> Result<()> {
        self.state()?
            .callbacks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DaemonError::rejected(format!("unknown callback {}", id.0)))
    }

    fn i2c_open(&self, bus: u32, address: u8) -> Result<Handle> {
        Ok(self.state()?.allocate(HandleKey::I2c { bus, address }))
    }

    fn i2c_close(&self, handle: Handle) -> Result<()> {
        self.state()?.release(handle)
    }

    fn i2c_read_byte_data(&self, handle: Handle, register: u8) -> Result<u8> {
        let state = self.state()?;
        let device = state.i2c_device(handle)?;
        Ok(state
            .i2c_registers
            .get(&device)
            .map_or(0, |regs| regs[usize::from(register)]))
    }

    fn i2c_write_byte_data(&self, handle: Handle, register: u8, value: u8) -> Result<()> {
        let mut state = self.state()?;
        let device = state.i2c_device(handle)?;
        state.i2c_registers.entry(device).or_insert([0; 256])[usize::from(register)] = value;
        state
            .i2c_writes
            .entry(device)
            .or_default()
            .push(vec![register, value]);
        Ok(())
    }

    fn i2c_read_device(&self, handle: Handle, count: usize) -> Result<Vec<u8>> {
        let mut state = self.state()?;
        let device = state.i2c_device(handle)?;
        let mut reply = state
            .i2c_reads
            .get_mut(&device)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        reply.resize(count, 0);
        Ok(reply)
    }

    fn i2c_write_device(&self, handle: Handle, data: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        let device = state.i2c_device(handle)?;
        state
            .i2c_writes
            .entry(device)
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    fn spi_open(&self, channel: u32, bitrate: u32, _flags: u32) -> Result<Handle> {
        Ok(self.state()?.allocate(HandleKey::Spi { channel, bitrate }))
    }

    fn spi_close(&self, handle: Handle) -> Result<()> {
        self.state()?.release(handle)
    }

    fn spi_xfer(&self, handle: Handle, data: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state()?;
        let channel = state.spi_channel(handle)?;
        state
            .spi_writes
            .entry(channel)
            .or_default()
            .push(data.to_vec());

        // Expander opcodes: 0b0100_AAAR, register, data
        if state.spi_expanders.contains(&channel) && data.len() >= 3 && data[0] & 0xF0 == 0x40 {
            let hw_address = (data[0] >> 1) & 0x07;
            let register = usize::from(data[1]);
            let regs = state
                .spi_registers
                .entry((channel, hw_address))
                .or_insert([0; 256]);
            let mut reply = vec![0; data.len()];
            if data[0] & 0x01 == 0x01 {
                reply[2] = regs[register];
            } else {
                regs[register] = data[2];
            }
            return Ok(reply);
        }

        let mut reply = state
            .spi_replies
            .get_mut(&channel)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        reply.resize(data.len(), 0);
        Ok(reply)
    }
}
