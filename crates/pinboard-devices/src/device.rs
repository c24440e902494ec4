//! Device lifecycle and the standard error path.
//!
//! A [`Device`] wraps one variant driver with the behavior every variant
//! shares:
//!
//! - **Lifecycle**: `Starting` while resources are acquired and the driver
//!   is set up, `Running` once ready, `Stopped` for good afterwards.
//! - **Error path**: any failure inside a public operation is logged,
//!   reported to the host, fires a rate-limited `pigpioError` trigger named
//!   after the error kind, and stops the device. Errors never reach the
//!   caller.
//! - **Stop**: idempotent; leaves the directory, leaves the interrupt relay,
//!   shuts the driver down, and releases handles and the connection. Each
//!   step runs even if an earlier one fails.
//! - **Polling** and **momentary** outputs that turn themselves off.
//!
//! Devices are created through [`Context::get_or_start`].

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use pinboard_core::{DeviceId, Error, ErrorKind, ResourceId, Result};
use pinboard_daemon::{EdgeCallback, EdgeEvent};
use tracing::{debug, info, trace, warn};

use crate::config::DeviceConfig;
use crate::context::Context;
use crate::interrupt::{self, InterruptRelay};
use crate::lock;
use crate::pool::Session;
use crate::state::{LogMode, StateSink};
use crate::variants::{AnyDriver, BusResources, Driver, EdgeAction, WriteOutcome};

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Stopped,
}

/// Poll rate observed over one status window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStatus {
    pub polls: u32,
    pub window: Duration,
    pub average_interval: Option<Duration>,
}

/// What one [`Device::poll`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// A read was performed.
    pub read: bool,
    /// A status window closed.
    pub status: Option<PollStatus>,
}

struct PollBook {
    last_poll: Option<Instant>,
    polls: u32,
    window_start: Instant,
}

/// One logical device.
pub struct Device {
    config: DeviceConfig,
    context: Weak<Context>,
    me: Weak<Device>,
    lifecycle: Mutex<Lifecycle>,
    driver: Mutex<Option<AnyDriver>>,
    resources: Mutex<Vec<ResourceId>>,
    relay: Option<Arc<InterruptRelay>>,
    polling: Mutex<PollBook>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", self.id())
            .field("type", &self.config.kind.type_name())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Device {
    /// Create and start a device. On failure the device is stopped, which
    /// releases whatever it acquired, and the error is returned for the
    /// caller to report.
    pub(crate) fn start(ctx: &Arc<Context>, config: DeviceConfig) -> Result<Arc<Device>> {
        let relay = config
            .is_relay_master()
            .then(|| Arc::new(InterruptRelay::new(config.id.clone())));

        let device = Arc::new_cyclic(|me| Device {
            config,
            context: Arc::downgrade(ctx),
            me: me.clone(),
            lifecycle: Mutex::new(Lifecycle::Starting),
            driver: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
            relay,
            polling: Mutex::new(PollBook {
                last_poll: None,
                polls: 0,
                window_start: Instant::now(),
            }),
        });

        debug!("Starting \"{}\" ({})", device.name(), device.config.kind.type_name());
        match device.initialize(ctx) {
            Ok(()) => {
                info!("Started \"{}\"", device.name());
                Ok(device)
            }
            Err(e) => {
                device.stop();
                Err(e)
            }
        }
    }

    fn initialize(&self, ctx: &Context) -> Result<()> {
        let host = &self.config.host;
        let connection_id = ResourceId::connection(&host.address, host.port);
        let session = ctx.pool().acquire_connection(&connection_id, || {
            Session::open(
                ctx.connector(),
                &host.address,
                host.port,
                &ctx.config().model_path,
            )
        })?;
        lock(&self.resources).push(connection_id.clone());

        let mut resources = BusResources::new(ctx.pool(), &session, &connection_id);
        let driver = AnyDriver::open(&self.config.kind, &mut resources, self.edge_callback());
        lock(&self.resources).extend(resources.into_acquired());
        let driver = driver?;

        *lock(&self.driver) = Some(driver);
        let mut lifecycle = lock(&self.lifecycle);
        if *lifecycle == Lifecycle::Stopped {
            return Err(Error::NotRunning(self.name().to_string()));
        }
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn edge_callback(&self) -> EdgeCallback {
        let me = self.me.clone();
        Arc::new(move |event: EdgeEvent| {
            if let Some(device) = me.upgrade() {
                device.handle_edge(event);
            }
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Interrupt relay of a relay master.
    pub fn relay(&self) -> Option<&Arc<InterruptRelay>> {
        self.relay.as_ref()
    }

    fn context(&self) -> Option<Arc<Context>> {
        self.context.upgrade()
    }

    /// Run `f` on the driver with a sink wired to the context.
    fn with_driver<T>(
        &self,
        f: impl FnOnce(&mut AnyDriver, &StateSink<'_>) -> Result<T>,
    ) -> Result<T> {
        let ctx = self
            .context()
            .ok_or_else(|| Error::NotRunning(format!("{}: context closed", self.name())))?;
        let sink = StateSink {
            device: self.id(),
            name: self.name(),
            reporter: ctx.reporter(),
            triggers: ctx.triggers(),
        };
        let mut guard = lock(&self.driver);
        let driver = guard
            .as_mut()
            .ok_or_else(|| Error::NotRunning(self.name().to_string()))?;
        f(driver, &sink)
    }

    /// Run the standard error path and stop.
    pub(crate) fn fail(&self, kind: ErrorKind, error: &Error) {
        if let Some(ctx) = self.context() {
            ctx.report_error(self.id(), self.name(), kind, error);
        } else {
            warn!("\"{}\" {}: {}", self.name(), kind, error);
        }
        self.stop();
    }

    /// Read the device and publish its state.
    ///
    /// `log_all` logs the value even if unchanged.
    pub fn read(&self, log_all: bool) {
        if !self.is_running() {
            debug!("Ignoring read of stopped \"{}\"", self.name());
            return;
        }
        let mode = LogMode::from_log_all(log_all || self.config.log_all);
        if let Err(e) = self.with_driver(|driver, sink| driver.read(sink, mode)) {
            self.fail(ErrorKind::Read, &e);
        }
    }

    /// Drive an output. Binary outputs accept exactly 0 and 1.
    pub fn write(&self, value: f64) {
        if !self.is_running() {
            warn!("Ignoring write of {} to stopped \"{}\"", value, self.name());
            return;
        }
        let mode = LogMode::from_log_all(self.config.log_all);
        match self.with_driver(|driver, sink| driver.write(sink, value, mode)) {
            Ok(WriteOutcome::On) => {
                if let Some(delay) = self.config.momentary() {
                    self.schedule_turn_off(delay);
                }
            }
            Ok(_) => {}
            Err(e) => self.fail(ErrorKind::Write, &e),
        }
    }

    /// Write 0 after `delay`, on the tokio runtime if there is one.
    fn schedule_turn_off(&self, delay: Duration) {
        let me = self.me.clone();
        let turn_off = move || {
            if let Some(device) = me.upgrade() {
                device.write(0.0);
            }
        };

        debug!("\"{}\" turns off in {:?}", self.name(), delay);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = tokio::task::spawn_blocking(turn_off).await {
                        warn!("Momentary turn-off task failed: {}", e);
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    turn_off();
                });
            }
        }
    }

    /// Read the device if polling is enabled and its interval has passed.
    pub fn poll(&self) -> PollOutcome {
        self.poll_at(Instant::now())
    }

    /// [`poll`](Self::poll) as if the current time were `now`.
    pub fn poll_at(&self, now: Instant) -> PollOutcome {
        let polling = &self.config.polling;
        if !polling.enabled || !self.is_running() {
            return PollOutcome::default();
        }

        let due = {
            let mut book = lock(&self.polling);
            let due = book
                .last_poll
                .is_none_or(|last| now.saturating_duration_since(last) >= polling.interval());
            if due {
                book.last_poll = Some(now);
                book.polls += 1;
            }
            due
        };
        if due {
            trace!("Polling \"{}\"", self.name());
            self.read(false);
        }

        let status = polling.status_interval().and_then(|window| {
            let mut book = lock(&self.polling);
            let elapsed = now.saturating_duration_since(book.window_start);
            if elapsed < window {
                return None;
            }
            let status = PollStatus {
                polls: book.polls,
                window: elapsed,
                average_interval: (book.polls > 0).then(|| elapsed / book.polls),
            };
            book.polls = 0;
            book.window_start = now;
            Some(status)
        });
        if let Some(status) = &status {
            match status.average_interval {
                Some(average) => info!(
                    "\"{}\" polled {} times in {:.1}s (every {:.3}s, {:.2}/s)",
                    self.name(),
                    status.polls,
                    status.window.as_secs_f64(),
                    average.as_secs_f64(),
                    f64::from(status.polls) / status.window.as_secs_f64()
                ),
                None => info!(
                    "\"{}\" not polled in {:.1}s",
                    self.name(),
                    status.window.as_secs_f64()
                ),
            }
        }

        PollOutcome { read: due, status }
    }

    /// Stop the device. Safe to call any number of times.
    pub fn stop(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Stopped {
                trace!("\"{}\" already stopped", self.name());
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        info!("Stopping \"{}\"", self.name());

        let ctx = self.context();
        // Only the registered instance of an id owns its relay membership.
        if let Some(ctx) = &ctx
            && ctx.directory().remove_if_same(self.id(), self)
            && self.config.relay_master().is_some()
        {
            ctx.deregister_source(self.id());
        }

        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver
            && let Err(e) = driver.shutdown()
        {
            warn!("\"{}\" {}: {}", self.name(), ErrorKind::Stop, e);
        }

        let resources = std::mem::take(&mut *lock(&self.resources));
        match &ctx {
            Some(ctx) => {
                for id in resources.iter().rev() {
                    ctx.pool().release(id);
                }
            }
            None if !resources.is_empty() => {
                debug!("\"{}\" context closed; resources dropped with it", self.name());
            }
            None => {}
        }
    }

    /// Claim a relayed interrupt. Only expander inputs take interrupts.
    pub fn interrupt(&self) -> Result<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        self.with_driver(|driver, sink| match driver.as_expander_mut() {
            Some(expander) => expander.interrupt(sink),
            None => Err(Error::Unsupported(format!(
                "{} does not take interrupts",
                self.name()
            ))),
        })
    }

    /// Clear a stuck interrupt.
    pub fn reset_interrupt(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.with_driver(|driver, sink| match driver.as_expander_mut() {
            Some(expander) => expander.reset_interrupt(sink),
            None => Err(Error::Unsupported(format!(
                "{} does not take interrupts",
                self.name()
            ))),
        })
    }

    pub(crate) fn enable_interrupt(&self) -> Result<()> {
        self.with_driver(|driver, _| match driver.as_expander_mut() {
            Some(expander) => expander.enable_interrupt(),
            None => Err(Error::Unsupported(format!(
                "{} does not take interrupts",
                self.name()
            ))),
        })
    }

    /// Add or remove an interrupt source of this relay master.
    ///
    /// Returns whether the source set changed; always `false` if this
    /// device is not a relay master.
    pub fn update_interrupt_devices(&self, source: &DeviceId, add: bool) -> bool {
        match &self.relay {
            Some(relay) => relay.update(source, add),
            None => {
                warn!(
                    "\"{}\" is not a relay master; cannot {} {}",
                    self.name(),
                    if add { "add" } else { "remove" },
                    source
                );
                false
            }
        }
    }

    /// Edge callback entry point, run on the daemon's callback thread.
    pub(crate) fn handle_edge(&self, event: EdgeEvent) {
        if !self.is_running() {
            trace!("\"{}\" ignoring edge while not running", self.name());
            return;
        }

        let action = self.with_driver(|driver, sink| match driver.as_gpio_mut() {
            Some(pin) => pin.on_edge(sink, event),
            None => Ok(EdgeAction::None),
        });
        let action = match action {
            Ok(action) => action,
            Err(e) => {
                self.fail(ErrorKind::Interrupt, &e);
                return;
            }
        };

        let (Some(ctx), Some(relay)) = (self.context(), self.relay.as_ref()) else {
            return;
        };
        match action {
            EdgeAction::None => {}
            EdgeAction::Dispatch => {
                interrupt::dispatch(&ctx, relay);
            }
            EdgeAction::Recover => {
                interrupt::recover(&ctx, relay);
                let result = self.with_driver(|driver, sink| match driver.as_gpio_mut() {
                    Some(pin) => pin.finish_recovery(sink).map(|_| ()),
                    None => Ok(()),
                });
                if let Err(e) = result {
                    self.fail(ErrorKind::Interrupt, &e);
                }
            }
        }
    }
}
