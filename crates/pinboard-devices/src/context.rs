//! Per-application device context.
//!
//! A [`Context`] owns everything devices share: the daemon connector, the
//! resource pool, the trigger dispatcher, the host reporter, the device
//! configurations, and the directory of running devices. Devices are started
//! lazily on first use and restarted on the next use after they stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use pinboard_core::constants::TRIGGER_DEVICE_ERROR;
use pinboard_core::{DeviceId, Error, ErrorKind, Result};
use pinboard_daemon::DaemonConnector;
use tracing::{debug, error, info, warn};

use crate::config::{ContextConfig, DeviceConfig};
use crate::device::Device;
use crate::directory::Directory;
use crate::events::TriggerDispatcher;
use crate::pool::ResourcePool;
use crate::report::{StateReporter, StateUpdate};

pub struct Context {
    config: ContextConfig,
    connector: Arc<dyn DaemonConnector>,
    reporter: Arc<dyn StateReporter>,
    pool: ResourcePool,
    triggers: TriggerDispatcher,
    directory: Directory,
    configs: RwLock<HashMap<DeviceId, DeviceConfig>>,
    closed: AtomicBool,
}

impl Context {
    pub fn open(
        config: ContextConfig,
        connector: Arc<dyn DaemonConnector>,
        reporter: Arc<dyn StateReporter>,
    ) -> Arc<Self> {
        debug!("Opening device context");
        Arc::new(Self {
            config,
            connector,
            reporter,
            pool: ResourcePool::new(),
            triggers: TriggerDispatcher::new(),
            directory: Directory::new(),
            configs: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn triggers(&self) -> &TriggerDispatcher {
        &self.triggers
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn reporter(&self) -> &dyn StateReporter {
        self.reporter.as_ref()
    }

    pub(crate) fn connector(&self) -> &dyn DaemonConnector {
        self.connector.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Add or replace a device configuration.
    ///
    /// A running device whose configuration changed is stopped; the next
    /// use starts it with the new settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn configure(&self, config: DeviceConfig) -> Result<()> {
        config.validate()?;
        let id = config.id.clone();
        let previous = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), config.clone());

        if previous.is_some_and(|previous| previous != config)
            && let Some(device) = self.directory.get(&id)
        {
            info!("Configuration of \"{}\" changed; restarting", device.name());
            device.stop();
        }
        Ok(())
    }

    /// Configure several devices, stopping at the first invalid one.
    ///
    /// # Errors
    ///
    /// As [`Context::configure`].
    pub fn configure_all(&self, configs: impl IntoIterator<Item = DeviceConfig>) -> Result<()> {
        configs.into_iter().try_for_each(|config| self.configure(config))
    }

    /// Forget a device, stopping it if it runs. Returns whether it was
    /// configured.
    pub fn remove(&self, id: &DeviceId) -> bool {
        let removed = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if let Some(device) = self.directory.get(id) {
            device.stop();
        }
        self.deregister_source(id);
        removed
    }

    pub fn device_config(&self, id: &DeviceId) -> Option<DeviceConfig> {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// The running device for `id`, if any.
    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.directory.get(id)
    }

    /// The running device for `id`, starting it first if `allow_create`.
    ///
    /// Start failures go through the standard error path and yield `None`.
    /// If two callers race to start the same device, both get the one
    /// registered first and the other is stopped.
    pub fn get_or_start(self: &Arc<Self>, id: &DeviceId, allow_create: bool) -> Option<Arc<Device>> {
        if let Some(device) = self.directory.get(id) {
            return Some(device);
        }
        if !allow_create {
            return None;
        }
        if self.is_closed() {
            warn!("Context closed; not starting {}", id);
            return None;
        }
        let Some(config) = self.device_config(id) else {
            let error = Error::MissingConfig(id.to_string());
            warn!("{}", error);
            return None;
        };

        let name = config.display_name().to_string();
        let device = match Device::start(self, config) {
            Ok(device) => device,
            Err(e) => {
                self.report_error(id, &name, e.suggested_kind(ErrorKind::Start), &e);
                return None;
            }
        };

        if let Err(existing) = self.directory.insert_if_absent(Arc::clone(&device)) {
            debug!("\"{}\" started concurrently; keeping the first", name);
            device.stop();
            return Some(existing);
        }

        if let Err(e) = self.attach(&device) {
            self.report_error(id, &name, e.suggested_kind(ErrorKind::Start), &e);
            device.stop();
            return None;
        }
        Some(device)
    }

    /// Wire a freshly registered device into the interrupt relay.
    fn attach(self: &Arc<Self>, device: &Arc<Device>) -> Result<()> {
        if let Some(master) = device.config().relay_master() {
            self.register_source(device.id(), master)?;
            device.enable_interrupt()?;
        }

        if device.relay().is_some() {
            for source in self.directory.sources_of(device.id()) {
                if self.directory.get(&source).is_some() {
                    device.update_interrupt_devices(&source, true);
                }
            }
        }
        Ok(())
    }

    /// Register `source` with `master`, first leaving any other master it
    /// was registered with.
    fn register_source(self: &Arc<Self>, source: &DeviceId, master: &DeviceId) -> Result<()> {
        if let Some(previous) = self.directory.set_membership(source, master)
            && previous != *master
            && let Some(old) = self.directory.get(&previous)
        {
            old.update_interrupt_devices(source, false);
        }

        let master_device = self.get_or_start(master, true).ok_or_else(|| {
            Error::Config(format!("relay master {master} of {source} is not available"))
        })?;
        if master_device.relay().is_none() {
            return Err(Error::Config(format!(
                "{master} is not configured as a relay master"
            )));
        }
        master_device.update_interrupt_devices(source, true);
        Ok(())
    }

    /// Remove `source` from the master it is registered with.
    pub(crate) fn deregister_source(&self, source: &DeviceId) {
        if let Some(master) = self.directory.take_membership(source)
            && let Some(master_device) = self.directory.get(&master)
        {
            master_device.update_interrupt_devices(source, false);
        }
    }

    /// Start every configured device. Returns how many are running.
    pub fn start_all(self: &Arc<Self>) -> usize {
        self.device_ids()
            .iter()
            .filter(|id| self.get_or_start(id, true).is_some())
            .count()
    }

    /// Poll every running device. Returns how many devices read.
    pub fn poll_all(&self) -> usize {
        self.directory
            .snapshot()
            .iter()
            .filter(|device| device.poll().read)
            .count()
    }

    /// Stop every device. Later starts are refused.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let devices = self.directory.snapshot();
        info!("Closing device context ({} running)", devices.len());
        for device in devices {
            device.stop();
        }
    }

    /// Standard error report: log, mark the device in the host, and fire a
    /// rate-limited trigger named after the error kind.
    pub(crate) fn report_error(&self, id: &DeviceId, name: &str, kind: ErrorKind, error: &Error) {
        error!("\"{}\" {}: {}", name, kind, error);
        self.reporter.update(id, StateUpdate::Error(kind));
        self.triggers.fire(
            TRIGGER_DEVICE_ERROR,
            kind.as_str(),
            &format!("{name}: {error}"),
            true,
        );
    }
}
