//! App-layer anomaly events
//!
//! Events raised by the dispatch core when protocol detection observes
//! something structurally wrong with a flow. They are collected on the
//! flow and drained by the alerting stages downstream.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Anomalies the dispatch core can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppLayerEventKind {
    /// The two half-streams detected different protocols
    MismatchProtocolBothDirections,
    /// The parser demands one direction first and the flow started with
    /// the other
    WrongDirectionFirstData,
    /// Only one direction ever produced a protocol match
    DetectProtocolOnlyOneDirection,
}

impl std::fmt::Display for AppLayerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppLayerEventKind::MismatchProtocolBothDirections => {
                write!(f, "applayer.mismatch_protocol_both_directions")
            }
            AppLayerEventKind::WrongDirectionFirstData => {
                write!(f, "applayer.wrong_direction_first_data")
            }
            AppLayerEventKind::DetectProtocolOnlyOneDirection => {
                write!(f, "applayer.detect_protocol_only_one_direction")
            }
        }
    }
}

/// A single raised event
#[derive(Debug, Clone, Serialize)]
pub struct AppLayerEvent {
    /// What was observed
    pub kind: AppLayerEventKind,
    /// When it was raised
    pub timestamp: DateTime<Utc>,
}

/// Per-flow event sink
#[derive(Debug, Clone, Default)]
pub struct AppLayerEvents {
    events: Vec<AppLayerEvent>,
}

impl AppLayerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an event on the sink
    pub fn raise(&mut self, kind: AppLayerEventKind) {
        self.events.push(AppLayerEvent {
            kind,
            timestamp: Utc::now(),
        });
    }

    /// Events raised so far, oldest first
    pub fn as_slice(&self) -> &[AppLayerEvent] {
        &self.events
    }

    /// Whether an event of the given kind has been raised
    pub fn contains(&self, kind: AppLayerEventKind) -> bool {
        self.events.iter().any(|e| e.kind == kind)
    }

    /// Drain the sink for downstream consumption
    pub fn drain(&mut self) -> Vec<AppLayerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
