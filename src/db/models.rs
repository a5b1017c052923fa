//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A monitored station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: i64,
    pub name: String,
    pub ip_address: String,
    pub notes: String,
    pub configured_parameters: BTreeSet<String>,
    pub active: bool,
    /// Consecutive failed pings before a ping alert (default 3)
    pub alert_ping_failures: Option<u32>,
    /// Hours without readings before a data gap alert (default 6)
    pub alert_gap_hours: Option<u32>,
    /// JSON object of `{"Param": [min, max]}`, either bound may be null
    pub alert_thresholds: String,
}

impl Default for Station {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            ip_address: String::new(),
            notes: String::new(),
            configured_parameters: BTreeSet::new(),
            active: true,
            alert_ping_failures: None,
            alert_gap_hours: None,
            alert_thresholds: String::new(),
        }
    }
}

impl Station {
    /// Name used in logs and alerts, falling back to the id.
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("Station {}", self.id)
        } else {
            self.name.clone()
        }
    }
}

/// A probe outcome that has not been written to the ledger yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSample {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Round-trip time in whole milliseconds, absent on failure
    pub latency_ms: Option<i64>,
}

/// A persisted probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub id: i64,
    pub station_id: i64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<i64>,
    /// Failed probes in a row at append time, 0 after a success
    pub consecutive_failures: i64,
}

/// A single parameter reading taken from a station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub id: i64,
    pub station_id: i64,
    pub parameter: String,
    pub value: f64,
    pub taken_at: DateTime<Utc>,
}
