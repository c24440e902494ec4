//! Event trigger dispatch with per-event rate limiting.
//!
//! Devices fire named triggers (`pigpioError`, `limitFault`) that host
//! listeners subscribe to with a [`TriggerFilter`]. Rate-limited triggers are
//! throttled per event name: a name firing again within
//! [`TRIGGER_SUPPRESS_WINDOW`] is suppressed until either the suppress
//! window passes or, to clear the limiting flag, [`TRIGGER_RECOVERY_WINDOW`]
//! elapses without a fire.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use pinboard_core::constants::{TRIGGER_RECOVERY_WINDOW, TRIGGER_SUPPRESS_WINDOW};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lock;

/// Event name part of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventName {
    /// Match every name of the event type.
    Any,
    Named(String),
}

impl EventName {
    pub fn named(name: impl Into<String>) -> Self {
        EventName::Named(name.into())
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            EventName::Any => true,
            EventName::Named(expected) => expected == name,
        }
    }
}

/// Selects which triggers a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFilter {
    pub event_type: String,
    pub event_name: EventName,
}

impl TriggerFilter {
    pub fn new(event_type: impl Into<String>, event_name: EventName) -> Self {
        Self {
            event_type: event_type.into(),
            event_name,
        }
    }

    /// Match every event of `event_type`.
    pub fn any(event_type: impl Into<String>) -> Self {
        Self::new(event_type, EventName::Any)
    }

    #[must_use]
    pub fn matches(&self, event_type: &str, event_name: &str) -> bool {
        self.event_type == event_type && self.event_name.matches(event_name)
    }
}

/// A trigger delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub event_type: String,
    pub event_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of [`TriggerDispatcher::fire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Delivered to this many listeners.
    Dispatched(usize),
    Suppressed,
}

impl FireOutcome {
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        matches!(self, FireOutcome::Dispatched(_))
    }
}

struct Listener {
    filter: TriggerFilter,
    tx: mpsc::UnboundedSender<TriggerEvent>,
}

#[derive(Debug, Clone, Copy)]
struct LimiterEntry {
    last_fire: Instant,
    limited: bool,
}

/// Delivers triggers to subscribed listeners.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
/// use pinboard_devices::events::{FireOutcome, TriggerDispatcher, TriggerFilter};
///
/// let triggers = TriggerDispatcher::new();
/// let mut rx = triggers.subscribe(TriggerFilter::any("pigpioError"));
///
/// let start = Instant::now();
/// let first = triggers.fire_at(start, "pigpioError", "readError", "adc failed", true);
/// let second = triggers.fire_at(
///     start + Duration::from_secs(5),
///     "pigpioError",
///     "readError",
///     "adc failed",
///     true,
/// );
///
/// assert_eq!(first, FireOutcome::Dispatched(1));
/// assert_eq!(second, FireOutcome::Suppressed);
/// assert_eq!(rx.try_recv().unwrap().event_name, "readError");
/// ```
#[derive(Default)]
pub struct TriggerDispatcher {
    listeners: Mutex<Vec<Listener>>,
    limiter: Mutex<HashMap<String, LimiterEntry>>,
}

impl TriggerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self, filter: TriggerFilter) -> mpsc::UnboundedReceiver<TriggerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(
            "Trigger listener subscribed to {}/{:?}",
            filter.event_type, filter.event_name
        );
        lock(&self.listeners).push(Listener { filter, tx });
        rx
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|listener| !listener.tx.is_closed());
        listeners.len()
    }

    /// Fire a trigger now.
    pub fn fire(
        &self,
        event_type: &str,
        event_name: &str,
        message: &str,
        rate_limited: bool,
    ) -> FireOutcome {
        self.fire_at(Instant::now(), event_type, event_name, message, rate_limited)
    }

    /// Fire a trigger as if the current time were `now`.
    pub fn fire_at(
        &self,
        now: Instant,
        event_type: &str,
        event_name: &str,
        message: &str,
        rate_limited: bool,
    ) -> FireOutcome {
        if rate_limited && !self.admit(now, event_name) {
            debug!("Suppressed trigger {}/{}", event_type, event_name);
            return FireOutcome::Suppressed;
        }

        let event = TriggerEvent {
            event_type: event_type.to_string(),
            event_name: event_name.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };

        let mut listeners = lock(&self.listeners);
        listeners.retain(|listener| !listener.tx.is_closed());
        let delivered = listeners
            .iter()
            .filter(|listener| listener.filter.matches(event_type, event_name))
            .filter(|listener| listener.tx.send(event.clone()).is_ok())
            .count();
        FireOutcome::Dispatched(delivered)
    }

    /// Whether `event_name` is currently being limited.
    pub fn is_limited(&self, event_name: &str) -> bool {
        lock(&self.limiter)
            .get(event_name)
            .is_some_and(|entry| entry.limited)
    }

    fn admit(&self, now: Instant, event_name: &str) -> bool {
        let mut limiter = lock(&self.limiter);
        let previous = limiter.insert(
            event_name.to_string(),
            LimiterEntry {
                last_fire: now,
                limited: false,
            },
        );

        let Some(previous) = previous else {
            return true;
        };

        let elapsed = now.saturating_duration_since(previous.last_fire);
        if elapsed >= TRIGGER_RECOVERY_WINDOW {
            if previous.limited {
                info!("No longer limiting triggers for {}", event_name);
            }
            return true;
        }

        let admitted = elapsed >= TRIGGER_SUPPRESS_WINDOW;
        if !admitted && !previous.limited {
            warn!("Now limiting frequent triggers for {}", event_name);
        }
        if let Some(entry) = limiter.get_mut(event_name) {
            entry.limited = previous.limited || !admitted;
        }
        admitted
    }
}
