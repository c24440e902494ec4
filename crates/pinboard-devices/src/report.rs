//! Host state reporting.
//!
//! Devices never hold host-side state themselves; every processed reading,
//! on/off change, and error is pushed through a [`StateReporter`] owned by
//! the host application.

use std::sync::Mutex;

use pinboard_core::{DeviceId, ErrorKind};
use tracing::{debug, info};

use crate::lock;
use crate::state::SensorReading;

/// Icon shown next to a device in the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateImage {
    SensorOn,
    SensorOff,
    /// Device stopped on an error.
    SensorTripped,
}

/// One "set this device's reported state" call.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Binary state of an input or output line.
    OnOff {
        on: bool,
        text: String,
        image: StateImage,
    },

    /// Processed analog value.
    Value(SensorReading),

    /// Device stopped on an error of this kind.
    Error(ErrorKind),
}

impl StateUpdate {
    /// Image the host should display for this update.
    #[must_use]
    pub fn image(&self) -> StateImage {
        match self {
            StateUpdate::OnOff { image, .. } => *image,
            StateUpdate::Value(reading) => match reading.on {
                Some(true) => StateImage::SensorOn,
                _ => StateImage::SensorOff,
            },
            StateUpdate::Error(_) => StateImage::SensorTripped,
        }
    }
}

/// Sink for device state owned by the host application.
pub trait StateReporter: Send + Sync {
    fn update(&self, device: &DeviceId, update: StateUpdate);
}

/// Reporter that keeps every update in memory.
///
/// # Examples
///
/// ```
/// use pinboard_core::{DeviceId, ErrorKind};
/// use pinboard_devices::report::{MemoryReporter, StateReporter, StateUpdate};
///
/// let reporter = MemoryReporter::new();
/// let id = DeviceId::new("relay-1").unwrap();
/// reporter.update(&id, StateUpdate::Error(ErrorKind::Read));
///
/// assert_eq!(reporter.errors(&id), vec![ErrorKind::Read]);
/// ```
#[derive(Debug, Default)]
pub struct MemoryReporter {
    updates: Mutex<Vec<(DeviceId, StateUpdate)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All updates in arrival order.
    pub fn history(&self) -> Vec<(DeviceId, StateUpdate)> {
        lock(&self.updates).clone()
    }

    /// Updates reported for one device, oldest first.
    pub fn updates_for(&self, device: &DeviceId) -> Vec<StateUpdate> {
        lock(&self.updates)
            .iter()
            .filter(|(id, _)| id == device)
            .map(|(_, update)| update.clone())
            .collect()
    }

    /// Most recent update for one device.
    pub fn last(&self, device: &DeviceId) -> Option<StateUpdate> {
        lock(&self.updates)
            .iter()
            .rev()
            .find(|(id, _)| id == device)
            .map(|(_, update)| update.clone())
    }

    /// Most recent on/off state of one device.
    pub fn last_on_off(&self, device: &DeviceId) -> Option<bool> {
        lock(&self.updates)
            .iter()
            .rev()
            .find_map(|(id, update)| match update {
                StateUpdate::OnOff { on, .. } if id == device => Some(*on),
                _ => None,
            })
    }

    /// Most recent analog reading of one device.
    pub fn last_reading(&self, device: &DeviceId) -> Option<SensorReading> {
        lock(&self.updates)
            .iter()
            .rev()
            .find_map(|(id, update)| match update {
                StateUpdate::Value(reading) if id == device => Some(reading.clone()),
                _ => None,
            })
    }

    /// Error kinds reported for one device, oldest first.
    pub fn errors(&self, device: &DeviceId) -> Vec<ErrorKind> {
        lock(&self.updates)
            .iter()
            .filter_map(|(id, update)| match update {
                StateUpdate::Error(kind) if id == device => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.updates).clear();
    }
}

impl StateReporter for MemoryReporter {
    fn update(&self, device: &DeviceId, update: StateUpdate) {
        lock(&self.updates).push((device.clone(), update));
    }
}

/// Reporter that only emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StateReporter for LogReporter {
    fn update(&self, device: &DeviceId, update: StateUpdate) {
        match update {
            StateUpdate::OnOff { text, .. } => debug!("{} state: {}", device, text),
            StateUpdate::Value(reading) => debug!("{} value: {}", device, reading.text),
            StateUpdate::Error(kind) => info!("{} marked as {}", device, kind),
        }
    }
}
