//! Interrupt relay from a GPIO master to expander sources.
//!
//! Expander chips share one interrupt line wired to a native GPIO input, the
//! relay master. When the line asserts, the master asks its registered
//! sources in registration order whether they raised it; the first one that
//! claims it handles it and the rest are not asked. If the line stays
//! asserted until the master's watchdog expires, every source gets its
//! interrupt reset.

use std::sync::Mutex;

use pinboard_core::{DeviceId, ErrorKind};
use tracing::{debug, warn};

use crate::context::Context;
use crate::lock;

/// Ordered set of interrupt sources of one master.
#[derive(Debug)]
pub struct InterruptRelay {
    master: DeviceId,
    sources: Mutex<Vec<DeviceId>>,
}

impl InterruptRelay {
    pub fn new(master: DeviceId) -> Self {
        Self {
            master,
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn master(&self) -> &DeviceId {
        &self.master
    }

    /// Add or remove a source. Returns whether the set changed.
    pub fn update(&self, source: &DeviceId, add: bool) -> bool {
        let mut sources = lock(&self.sources);
        let position = sources.iter().position(|id| id == source);
        match (add, position) {
            (true, None) => {
                sources.push(source.clone());
                debug!("{} relays interrupts of {}", self.master, source);
                true
            }
            (false, Some(index)) => {
                sources.remove(index);
                debug!("{} no longer relays interrupts of {}", self.master, source);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the sources in registration order.
    pub fn sources(&self) -> Vec<DeviceId> {
        lock(&self.sources).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.sources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ask each source whether it raised the interrupt, stopping at the first
/// that claims it.
///
/// A source that fails goes through the standard error path and the search
/// continues. Returns the claiming source.
pub fn dispatch(ctx: &Context, relay: &InterruptRelay) -> Option<DeviceId> {
    for source_id in relay.sources() {
        let Some(source) = ctx.directory().get(&source_id) else {
            debug!("Interrupt source {} is not running", source_id);
            continue;
        };
        match source.interrupt() {
            Ok(true) => return Some(source_id),
            Ok(false) => {}
            Err(e) => source.fail(ErrorKind::Interrupt, &e),
        }
    }
    warn!("No source claimed interrupt on {}", relay.master());
    None
}

/// Reset the interrupt of every running source. Returns how many were reset.
pub fn recover(ctx: &Context, relay: &InterruptRelay) -> usize {
    let mut reset = 0;
    for source_id in relay.sources() {
        let Some(source) = ctx.directory().get(&source_id) else {
            continue;
        };
        match source.reset_interrupt() {
            Ok(()) => reset += 1,
            Err(e) => source.fail(ErrorKind::Interrupt, &e),
        }
    }
    reset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    #[test]
    fn test_update_keeps_registration_order() {
        let relay = InterruptRelay::new(id("int"));
        assert!(relay.update(&id("b"), true));
        assert!(relay.update(&id("a"), true));
        assert!(!relay.update(&id("b"), true));
        assert_eq!(relay.sources(), vec![id("b"), id("a")]);

        assert!(relay.update(&id("b"), false));
        assert!(!relay.update(&id("b"), false));
        assert_eq!(relay.sources(), vec![id("a")]);
    }
}
