//! Reference-counted sharing of daemon connections and bus handles.
//!
//! Devices on the same daemon host share one connection; devices on the
//! same I2C address, SPI channel, or GPIO chip share one handle. The pool
//! opens a resource on its first acquisition and closes it when the last
//! holder releases it. All acquisitions and releases are serialized by one
//! lock, which is also held while a factory opens a new resource.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pinboard_core::constants::{DEFAULT_GPIO_CHIP, PI5_GPIO_CHIP, PI5_MODEL_MARKER};
use pinboard_core::{Error, HandleKey, ResourceId, Result};
use pinboard_daemon::{DaemonConnection, DaemonConnector, Handle};
use tracing::{debug, info, trace, warn};

use crate::lock;

/// What the daemon host reported about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub model: String,

    /// GPIO chip carrying the header pins on this model.
    pub gpio_chip: u32,
}

impl HostInfo {
    #[must_use]
    pub fn from_model(model: &str) -> Self {
        let gpio_chip = if model.contains(PI5_MODEL_MARKER) {
            PI5_GPIO_CHIP
        } else {
            DEFAULT_GPIO_CHIP
        };
        Self {
            model: model.to_string(),
            gpio_chip,
        }
    }
}

/// A live daemon connection plus the identity of its host.
#[derive(Clone)]
pub struct Session {
    pub connection: Arc<dyn DaemonConnection>,
    pub host: HostInfo,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("live", &self.connection.is_live())
            .field("host", &self.host)
            .finish()
    }
}

impl Session {
    /// Connect to a daemon and identify its host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the daemon cannot be reached or the
    /// host model cannot be read. A connection opened before identification
    /// failed is closed again.
    pub fn open(
        connector: &dyn DaemonConnector,
        host: &str,
        port: u16,
        model_path: &str,
    ) -> Result<Session> {
        let connection = connector.open(host, port)?;

        let model = match connection.file_read(model_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string(),
            Err(e) => {
                if let Err(close_err) = connection.close() {
                    debug!("Closing unidentified connection failed: {}", close_err);
                }
                return Err(Error::Connection(format!(
                    "cannot identify host {host}:{port}: {e}"
                )));
            }
        };

        let host_info = HostInfo::from_model(&model);
        info!(
            "Connected to {}:{} ({}, gpiochip{})",
            host, port, host_info.model, host_info.gpio_chip
        );
        Ok(Session {
            connection,
            host: host_info,
        })
    }
}

enum Pooled {
    Session(Session),
    Handle {
        handle: Handle,
        connection: Arc<dyn DaemonConnection>,
    },
}

struct Entry {
    resource: Pooled,
    use_count: usize,
}

/// Shared connections and handles keyed by [`ResourceId`].
#[derive(Default)]
pub struct ResourcePool {
    entries: Mutex<HashMap<ResourceId, Entry>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the connection identified by `id`, opening it with `factory`
    /// if nobody holds it yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the factory fails or yields a
    /// connection that is not live; no entry is recorded in that case, and a
    /// dead connection is closed.
    pub fn acquire_connection<F>(&self, id: &ResourceId, factory: F) -> Result<Session>
    where
        F: FnOnce() -> Result<Session>,
    {
        let mut entries = lock(&self.entries);

        if let Some(entry) = entries.get_mut(id) {
            return match &entry.resource {
                Pooled::Session(session) => {
                    entry.use_count += 1;
                    trace!("{} use count {}", id, entry.use_count);
                    Ok(session.clone())
                }
                Pooled::Handle { .. } => Err(Error::Config(format!(
                    "resource {id} is not a connection"
                ))),
            };
        }

        let session = factory().map_err(|e| {
            if e.is_connection() {
                e
            } else {
                Error::Connection(format!("{id}: {e}"))
            }
        })?;
        if !session.connection.is_live() {
            if let Err(e) = session.connection.close() {
                debug!("Closing dead connection {} failed: {}", id, e);
            }
            return Err(Error::Connection(format!("connection to {id} is not live")));
        }

        debug!("Opened connection {}", id);
        entries.insert(
            id.clone(),
            Entry {
                resource: Pooled::Session(session.clone()),
                use_count: 1,
            },
        );
        Ok(session)
    }

    /// Acquire the handle identified by `id`, opening it on `connection` with
    /// `factory` if nobody holds it yet.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; no entry is recorded in that case.
    pub fn acquire_handle<F>(
        &self,
        id: &ResourceId,
        connection: &Arc<dyn DaemonConnection>,
        factory: F,
    ) -> Result<Handle>
    where
        F: FnOnce(&dyn DaemonConnection) -> Result<Handle>,
    {
        let mut entries = lock(&self.entries);

        if let Some(entry) = entries.get_mut(id) {
            return match &entry.resource {
                Pooled::Handle { handle, .. } => {
                    entry.use_count += 1;
                    trace!("{} use count {}", id, entry.use_count);
                    Ok(*handle)
                }
                Pooled::Session(_) => Err(Error::Config(format!("resource {id} is not a handle"))),
            };
        }

        let handle = factory(connection.as_ref())?;
        debug!("Opened handle {} for {}", handle, id);
        entries.insert(
            id.clone(),
            Entry {
                resource: Pooled::Handle {
                    handle,
                    connection: Arc::clone(connection),
                },
                use_count: 1,
            },
        );
        Ok(handle)
    }

    /// Drop one reference to `id`, closing the resource with the last one.
    ///
    /// Releasing an unknown id is a no-op. Close failures are logged, not
    /// returned.
    pub fn release(&self, id: &ResourceId) {
        let mut entries = lock(&self.entries);

        let Some(entry) = entries.get_mut(id) else {
            debug!("Release of unknown resource {}", id);
            return;
        };
        entry.use_count = entry.use_count.saturating_sub(1);
        if entry.use_count > 0 {
            trace!("{} use count {}", id, entry.use_count);
            return;
        }

        let Some(entry) = entries.remove(id) else {
            return;
        };
        let result = match entry.resource {
            Pooled::Session(session) => session.connection.close(),
            Pooled::Handle { handle, connection } => match id.handle_key() {
                Some(HandleKey::GpioChip(_)) => connection.gpiochip_close(handle),
                Some(HandleKey::I2c { .. }) => connection.i2c_close(handle),
                Some(HandleKey::Spi { .. }) => connection.spi_close(handle),
                None => Ok(()),
            },
        };
        match result {
            Ok(()) => debug!("Closed {}", id),
            Err(e) => warn!("Failed to close {}: {}", id, e),
        }
    }

    /// Current holders of `id`; zero if it is not open.
    pub fn use_count(&self, id: &ResourceId) -> usize {
        lock(&self.entries)
            .get(id)
            .map_or(0, |entry| entry.use_count)
    }

    /// Number of open resources.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinboard_core::constants::HOST_MODEL_PATH;
    use pinboard_daemon::mock::MockDaemon;
    use rstest::rstest;

    fn open(daemon: &MockDaemon) -> Result<Session> {
        Session::open(daemon, "pi", 8889, HOST_MODEL_PATH)
    }

    #[rstest]
    #[case("Raspberry Pi 5 Model B Rev 1.0", 4)]
    #[case("Raspberry Pi 4 Model B Rev 1.5", 0)]
    #[case("", 0)]
    fn test_gpio_chip_from_model(#[case] model: &str, #[case] chip: u32) {
        assert_eq!(HostInfo::from_model(model).gpio_chip, chip);
    }

    #[test]
    fn test_session_identifies_host() {
        let daemon = MockDaemon::new();
        daemon.set_model(Some("Raspberry Pi 5 Model B Rev 1.0"));
        let session = open(&daemon).unwrap();
        assert_eq!(session.host.model, "Raspberry Pi 5 Model B Rev 1.0");
        assert_eq!(session.host.gpio_chip, 4);
    }

    #[test]
    fn test_unidentified_session_is_closed() {
        let daemon = MockDaemon::new();
        daemon.set_model(None);
        let err = open(&daemon).unwrap_err();
        assert!(err.is_connection());
        assert_eq!(daemon.connections_closed(), 1);
    }

    #[test]
    fn test_connection_shared_until_last_release() {
        let daemon = MockDaemon::new();
        let pool = ResourcePool::new();
        let id = ResourceId::connection("pi", 8889);

        for _ in 0..3 {
            pool.acquire_connection(&id, || open(&daemon)).unwrap();
        }
        assert_eq!(daemon.connections_opened(), 1);
        assert_eq!(pool.use_count(&id), 3);

        pool.release(&id);
        pool.release(&id);
        assert_eq!(daemon.connections_closed(), 0);

        pool.release(&id);
        assert_eq!(daemon.connections_closed(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_failed_factory_records_nothing() {
        let daemon = MockDaemon::new();
        daemon.set_reachable(false);
        let pool = ResourcePool::new();
        let id = ResourceId::connection("pi", 8889);

        let err = pool.acquire_connection(&id, || open(&daemon)).unwrap_err();
        assert!(err.is_connection());
        assert_eq!(pool.use_count(&id), 0);
    }

    #[test]
    fn test_dead_connection_rejected() {
        let daemon = MockDaemon::new();
        daemon.set_accepting(false);
        let pool = ResourcePool::new();
        let id = ResourceId::connection("pi", 8889);

        let result = pool.acquire_connection(&id, || {
            Ok(Session {
                connection: daemon.open("pi", 8889)?,
                host: HostInfo::from_model("test"),
            })
        });
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(pool.is_empty());
        assert_eq!(daemon.connections_opened(), 1);
        assert_eq!(daemon.connections_closed(), 1);
    }

    #[test]
    fn test_handles_shared_and_closed_by_class() {
        let daemon = MockDaemon::new();
        let pool = ResourcePool::new();
        let conn_id = ResourceId::connection("pi", 8889);
        let session = pool.acquire_connection(&conn_id, || open(&daemon)).unwrap();

        let i2c = conn_id.i2c(1, 0x20);
        let first = pool
            .acquire_handle(&i2c, &session.connection, |c| Ok(c.i2c_open(1, 0x20)?))
            .unwrap();
        let second = pool
            .acquire_handle(&i2c, &session.connection, |c| Ok(c.i2c_open(1, 0x20)?))
            .unwrap();
        assert_eq!(first, second);

        let key = HandleKey::I2c {
            bus: 1,
            address: 0x20,
        };
        assert_eq!(daemon.open_count(key), 1);

        pool.release(&i2c);
        pool.release(&i2c);
        assert_eq!(daemon.close_count(key), 1);
        assert_eq!(daemon.open_handles(), 0);
    }

    #[test]
    fn test_close_failure_is_swallowed() {
        let daemon = MockDaemon::new();
        let pool = ResourcePool::new();
        let conn_id = ResourceId::connection("pi", 8889);
        let session = pool.acquire_connection(&conn_id, || open(&daemon)).unwrap();
        let spi = conn_id.spi(0, 1_000_000);
        pool.acquire_handle(&spi, &session.connection, |c| Ok(c.spi_open(0, 1_000_000, 0)?))
            .unwrap();

        // Closing the connection first invalidates the handle.
        pool.release(&conn_id);
        pool.release(&spi);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let pool = ResourcePool::new();
        pool.release(&ResourceId::connection("nowhere", 1));
        assert!(pool.is_empty());
    }
}
