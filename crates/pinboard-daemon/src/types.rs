//! Common types shared by the daemon capability and its implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque daemon-assigned identifier of an open bus resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub i32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a registered edge callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Edges an edge callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition to `level` is reported by a callback on this edge.
    #[must_use]
    pub fn matches(&self, level: bool) -> bool {
        match self {
            Edge::Rising => level,
            Edge::Falling => !level,
            Edge::Both => true,
        }
    }
}

/// Pull resistor configuration of an input line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    #[default]
    None,
    Up,
    Down,
}

/// Level reported to an edge callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeLevel {
    Low,
    High,
    /// No edge arrived within the armed watchdog window.
    WatchdogTimeout,
}

impl From<bool> for EdgeLevel {
    fn from(level: bool) -> Self {
        if level { EdgeLevel::High } else { EdgeLevel::Low }
    }
}

/// One edge report delivered by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub chip: u32,
    pub gpio: u32,
    pub level: EdgeLevel,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Callback invoked on the daemon's callback thread.
pub type EdgeCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;
