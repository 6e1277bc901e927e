//! Telemetry line classification.
//!
//! The rig emits newline-delimited ASCII. A line is either a JSON object
//! describing the current hardware configuration, or a comma-separated event
//! record whose field count selects its kind:
//!
//! | Fields | Record                                        |
//! |--------|-----------------------------------------------|
//! | 4      | `component,action,start_ts,end_ts` (behavior) |
//! | 2      | `tag,timestamp` (imaging frame)               |
//!
//! Anything else is a [`MalformedLine`]. Classification is pure; storing and
//! persisting the result is the controller's job.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Placeholder the firmware sends for a timestamp that has no value yet.
pub const UNSET_TOKEN: &str = "_";

/// Field delimiter for event records.
pub const FIELD_DELIMITER: char = ',';

/// Component tag of the infusion pump.
pub const PUMP_COMPONENT: &str = "PUMP";

/// Action tag of a pump infusion.
pub const INFUSION_ACTION: &str = "INFUSION";

/// Device-clock timestamp of a behavior event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// Milliseconds on the microcontroller clock
    Tick(i64),
    /// The firmware sent [`UNSET_TOKEN`]
    Unset,
}

impl Timestamp {
    fn parse(raw: &str) -> Result<Self, MalformedLine> {
        let raw = raw.trim();
        if raw == UNSET_TOKEN {
            return Ok(Timestamp::Unset);
        }
        raw.parse::<i64>()
            .map(Timestamp::Tick)
            .map_err(|_| MalformedLine::BadTimestamp(raw.to_string()))
    }

    /// The tick value, `None` when unset.
    pub fn tick(&self) -> Option<i64> {
        match self {
            Timestamp::Tick(t) => Some(*t),
            Timestamp::Unset => None,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Tick(t) => write!(f, "{t}"),
            Timestamp::Unset => f.write_str(UNSET_TOKEN),
        }
    }
}

// Dashboards expect the placeholder string verbatim, not `null`.
impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Timestamp::Tick(t) => serializer.serialize_i64(*t),
            Timestamp::Unset => serializer.serialize_str(UNSET_TOKEN),
        }
    }
}

/// One rig-generated interaction (lever press, infusion, lick, stim, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BehaviorEvent {
    /// Hardware that produced the event, e.g. `LH_LEVER`
    #[serde(rename = "Component")]
    pub component: String,
    /// What happened, e.g. `ACTIVE_PRESS`
    #[serde(rename = "Action")]
    pub action: String,
    /// Device time the event began
    #[serde(rename = "Start Timestamp")]
    pub start_timestamp: Timestamp,
    /// Device time the event ended
    #[serde(rename = "End Timestamp")]
    pub end_timestamp: Timestamp,
}

impl BehaviorEvent {
    /// A pump infusion, the event the infusion limit counts.
    pub fn is_infusion(&self) -> bool {
        self.component == PUMP_COMPONENT && self.action == INFUSION_ACTION
    }
}

/// One imaging-frame tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FrameEvent {
    /// Device timestamp, kept as sent
    pub timestamp: String,
}

/// Result of classifying a single telemetry line.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// Full hardware configuration, replacing the previous one
    Configuration(Map<String, Value>),
    /// Four-field record
    Behavior(BehaviorEvent),
    /// Two-field record
    Frame(FrameEvent),
}

/// A line that is neither a configuration document nor a known record shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedLine {
    /// Not 2 or 4 comma-separated fields
    #[error("unexpected field count {0}")]
    FieldCount(usize),

    /// A behavior timestamp is neither an integer nor `_`
    #[error("invalid timestamp '{0}'")]
    BadTimestamp(String),
}

/// Classify one logical line (no embedded newlines).
pub fn classify(line: &str) -> Result<Telemetry, MalformedLine> {
    let line = line.trim();

    if let Ok(document) = serde_json::from_str::<Map<String, Value>>(line) {
        return Ok(Telemetry::Configuration(document));
    }

    let parts: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    match parts.as_slice() {
        [component, action, start, end] => Ok(Telemetry::Behavior(BehaviorEvent {
            component: component.trim().to_string(),
            action: action.trim().to_string(),
            start_timestamp: Timestamp::parse(start)?,
            end_timestamp: Timestamp::parse(end)?,
        })),
        [_tag, timestamp] => Ok(Telemetry::Frame(FrameEvent {
            timestamp: timestamp.trim().to_string(),
        })),
        other => Err(MalformedLine::FieldCount(other.len())),
    }
}

/// Split a raw read into logical lines.
///
/// A single read may carry several newline-separated lines.
pub fn split_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.split('\n').map(str::trim)
}
