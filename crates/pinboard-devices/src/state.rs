//! Shared value processing for all device variants.
//!
//! Binary devices go through [`update_on_off`]; analog devices go through
//! [`process_value`], which applies [`Scaling`], detects significant changes,
//! evaluates limits, and fires limit-fault triggers on rising edges.

use pinboard_core::DeviceId;
use pinboard_core::constants::{
    CHANGE_EPSILON, EVENT_HIGH_LIMIT, EVENT_LOW_LIMIT, TRIGGER_LIMIT_FAULT,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::TriggerDispatcher;
use crate::report::{StateImage, StateReporter, StateUpdate};

/// How a state update is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Log only when the value changed.
    Changes,
    /// Log every update.
    All,
    /// Never log; used on high-frequency interrupt paths.
    Suppressed,
}

impl LogMode {
    #[must_use]
    pub fn from_log_all(log_all: bool) -> Self {
        if log_all { LogMode::All } else { LogMode::Changes }
    }
}

/// Everything a driver needs to publish state.
pub struct StateSink<'a> {
    pub device: &'a DeviceId,
    pub name: &'a str,
    pub reporter: &'a dyn StateReporter,
    pub triggers: &'a TriggerDispatcher,
}

/// Publish a binary state.
///
/// Returns `true` if the state differs from `prior`.
pub fn update_on_off(sink: &StateSink<'_>, prior: &mut Option<bool>, on: bool, mode: LogMode) -> bool {
    let changed = *prior != Some(on);
    *prior = Some(on);

    let text = if on { "on" } else { "off" };
    match mode {
        LogMode::All => info!("\"{}\" {}", sink.name, text),
        LogMode::Changes if changed => info!("\"{}\" {}", sink.name, text),
        _ => {}
    }

    sink.reporter.update(
        sink.device,
        StateUpdate::OnOff {
            on,
            text: text.to_string(),
            image: if on {
                StateImage::SensorOn
            } else {
                StateImage::SensorOff
            },
        },
    );
    changed
}

/// Conversion from a raw device value to a reported value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scaling {
    /// Multiplier applied to the raw value.
    pub factor: f64,

    /// Units appended to the displayed value.
    pub units: String,

    /// Minimum change, in percent of the prior value, that counts as a change.
    /// `None` treats every difference as a change.
    pub change_threshold_pct: Option<f64>,

    /// Scaled values at or above this are reported as "on".
    pub on_threshold: Option<f64>,

    pub low_limit: Option<f64>,
    pub high_limit: Option<f64>,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            factor: 1.0,
            units: String::new(),
            change_threshold_pct: None,
            on_threshold: None,
            low_limit: None,
            high_limit: None,
        }
    }
}

/// Per-device memory carried between analog readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorState {
    prior: Option<f64>,
    low_fault: bool,
    high_fault: bool,
}

impl SensorState {
    #[must_use]
    pub fn prior(&self) -> Option<f64> {
        self.prior
    }
}

/// A fully processed analog reading.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub raw: f64,
    pub scaled: f64,
    pub prior: Option<f64>,
    /// Change relative to the prior value, in percent.
    pub change_pct: f64,
    pub change_detected: bool,
    pub on: Option<bool>,
    pub low_fault: bool,
    pub high_fault: bool,
    /// Display text, e.g. `"21.4 °C"`.
    pub text: String,
}

/// A limit that was just crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEdge {
    Low,
    High,
}

impl FaultEdge {
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            FaultEdge::Low => EVENT_LOW_LIMIT,
            FaultEdge::High => EVENT_HIGH_LIMIT,
        }
    }
}

/// Format a value with precision depending on its magnitude.
///
/// Two decimals below 10, one below 100, none above.
#[must_use]
pub fn format_value(value: f64, units: &str) -> String {
    let magnitude = value.abs();
    let number = if magnitude < 10.0 {
        format!("{value:.2}")
    } else if magnitude < 100.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.0}")
    };

    if units.is_empty() {
        number
    } else {
        format!("{number} {units}")
    }
}

/// Apply scaling to a raw value and update `state`.
///
/// Returns the reading and the limits that became violated with this value.
/// A limit still violated from the previous reading is not returned again.
pub fn evaluate(scaling: &Scaling, state: &mut SensorState, raw: f64) -> (SensorReading, Vec<FaultEdge>) {
    let scaled = raw * scaling.factor;
    let prior = state.prior;

    let (change_pct, change_detected) = match prior {
        None => (0.0, true),
        Some(prior) => {
            let pct = (scaled - prior).abs() / prior.abs().max(CHANGE_EPSILON) * 100.0;
            let detected = match scaling.change_threshold_pct {
                Some(threshold) => pct > threshold,
                None => scaled != prior,
            };
            (pct, detected)
        }
    };

    let low_fault = scaling.low_limit.is_some_and(|limit| scaled < limit);
    let high_fault = scaling.high_limit.is_some_and(|limit| scaled > limit);

    let mut edges = Vec::new();
    if low_fault && !state.low_fault {
        edges.push(FaultEdge::Low);
    }
    if high_fault && !state.high_fault {
        edges.push(FaultEdge::High);
    }

    state.prior = Some(scaled);
    state.low_fault = low_fault;
    state.high_fault = high_fault;

    let reading = SensorReading {
        raw,
        scaled,
        prior,
        change_pct,
        change_detected,
        on: scaling.on_threshold.map(|threshold| scaled >= threshold),
        low_fault,
        high_fault,
        text: format_value(scaled, &scaling.units),
    };
    (reading, edges)
}

/// Process a raw analog value: evaluate it, log, report, and fire limit
/// triggers.
pub fn process_value(
    sink: &StateSink<'_>,
    scaling: &Scaling,
    state: &mut SensorState,
    raw: f64,
    mode: LogMode,
) -> SensorReading {
    let (reading, edges) = evaluate(scaling, state, raw);

    match mode {
        LogMode::All => info!("\"{}\" {}", sink.name, reading.text),
        LogMode::Changes if reading.change_detected => {
            info!(
                "\"{}\" {} ({:.2}% change)",
                sink.name, reading.text, reading.change_pct
            );
        }
        _ => debug!("\"{}\" raw {} -> {}", sink.name, raw, reading.text),
    }

    for edge in edges {
        let message = match edge {
            FaultEdge::Low => format!("{} below low limit: {}", sink.name, reading.text),
            FaultEdge::High => format!("{} above high limit: {}", sink.name, reading.text),
        };
        warn!("{}", message);
        sink.triggers
            .fire(TRIGGER_LIMIT_FAULT, edge.event_name(), &message, true);
    }

    sink.reporter
        .update(sink.device, StateUpdate::Value(reading.clone()));
    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventName, TriggerFilter};
    use crate::report::MemoryReporter;
    use rstest::rstest;

    fn scaling_with_threshold(threshold: f64) -> Scaling {
        Scaling {
            change_threshold_pct: Some(threshold),
            ..Scaling::default()
        }
    }

    #[test]
    fn test_first_reading_is_a_change() {
        let mut state = SensorState::default();
        let (reading, _) = evaluate(&Scaling::default(), &mut state, 3.3);
        assert!(reading.change_detected);
        assert_eq!(reading.prior, None);
        assert_eq!(state.prior(), Some(3.3));
    }

    #[rstest]
    #[case(0.4, true)]
    #[case(1.0, false)]
    fn test_change_threshold(#[case] threshold: f64, #[case] expected: bool) {
        let scaling = scaling_with_threshold(threshold);
        let mut state = SensorState::default();
        evaluate(&scaling, &mut state, 10.0);

        let (reading, _) = evaluate(&scaling, &mut state, 10.05);
        assert!((reading.change_pct - 0.5).abs() < 1e-9);
        assert_eq!(reading.change_detected, expected);
    }

    #[test]
    fn test_change_at_threshold_is_not_detected() {
        let scaling = scaling_with_threshold(12.5);
        let mut state = SensorState::default();
        evaluate(&scaling, &mut state, 4.0);

        let (reading, _) = evaluate(&scaling, &mut state, 4.5);
        assert_eq!(reading.change_pct, 12.5);
        assert!(!reading.change_detected);
    }

    #[test]
    fn test_zero_prior_does_not_divide_by_zero() {
        let mut state = SensorState::default();
        evaluate(&Scaling::default(), &mut state, 0.0);
        let (reading, _) = evaluate(&Scaling::default(), &mut state, 1.0);
        assert!(reading.change_pct.is_finite());
        assert!(reading.change_detected);
    }

    #[test]
    fn test_fault_fires_on_rising_edge_only() {
        let scaling = Scaling {
            high_limit: Some(50.0),
            ..Scaling::default()
        };
        let mut state = SensorState::default();

        let edges: Vec<Vec<FaultEdge>> = [40.0, 60.0, 61.0, 40.0, 70.0]
            .iter()
            .map(|raw| evaluate(&scaling, &mut state, *raw).1)
            .collect();

        assert_eq!(
            edges,
            vec![
                vec![],
                vec![FaultEdge::High],
                vec![],
                vec![],
                vec![FaultEdge::High]
            ]
        );
    }

    #[test]
    fn test_scaling_and_on_threshold() {
        let scaling = Scaling {
            factor: 100.0,
            units: "%".to_string(),
            on_threshold: Some(50.0),
            ..Scaling::default()
        };
        let mut state = SensorState::default();
        let (reading, _) = evaluate(&scaling, &mut state, 0.75);
        assert_eq!(reading.scaled, 75.0);
        assert_eq!(reading.on, Some(true));
        assert_eq!(reading.text, "75.0 %");
    }

    #[rstest]
    #[case(2.046, "", "2.05")]
    #[case(-3.14159, "V", "-3.14 V")]
    #[case(21.44, "°C", "21.4 °C")]
    #[case(1013.25, "hPa", "1013 hPa")]
    fn test_format_value(#[case] value: f64, #[case] units: &str, #[case] expected: &str) {
        assert_eq!(format_value(value, units), expected);
    }

    #[test]
    fn test_process_value_reports_and_fires_limit_trigger() {
        let reporter = MemoryReporter::new();
        let triggers = TriggerDispatcher::new();
        let mut faults = triggers.subscribe(TriggerFilter::new(
            TRIGGER_LIMIT_FAULT,
            EventName::named(EVENT_LOW_LIMIT),
        ));
        let device = DeviceId::new("tank").unwrap();
        let sink = StateSink {
            device: &device,
            name: "Tank level",
            reporter: &reporter,
            triggers: &triggers,
        };
        let scaling = Scaling {
            low_limit: Some(1.0),
            ..Scaling::default()
        };
        let mut state = SensorState::default();

        process_value(&sink, &scaling, &mut state, 0.5, LogMode::Changes);
        process_value(&sink, &scaling, &mut state, 0.4, LogMode::Changes);

        let event = faults.try_recv().unwrap();
        assert_eq!(event.event_name, EVENT_LOW_LIMIT);
        assert!(faults.try_recv().is_err());

        let reading = reporter.last_reading(&device).unwrap();
        assert_eq!(reading.scaled, 0.4);
        assert!(reading.low_fault);
    }

    #[test]
    fn test_update_on_off_reports_change() {
        let reporter = MemoryReporter::new();
        let triggers = TriggerDispatcher::new();
        let device = DeviceId::new("door").unwrap();
        let sink = StateSink {
            device: &device,
            name: "Door",
            reporter: &reporter,
            triggers: &triggers,
        };
        let mut prior = None;

        assert!(update_on_off(&sink, &mut prior, true, LogMode::Changes));
        assert!(!update_on_off(&sink, &mut prior, true, LogMode::Suppressed));
        assert!(update_on_off(&sink, &mut prior, false, LogMode::All));

        assert_eq!(reporter.updates_for(&device).len(), 3);
        assert_eq!(reporter.last_on_off(&device), Some(false));
    }
}
