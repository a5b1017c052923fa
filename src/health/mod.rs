//! Station health evaluation.
//!
//! Health is never stored. Every call recomputes it from the probe ledger,
//! so a station cannot get stuck in a state because a transition was missed.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::db::{DbError, Station, Store};

/// Shown instead of a reason list when the ledger could not be read.
pub const STATUS_UNAVAILABLE: &str = "Status unavailable";

/// Thresholds used to classify a station.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// A station whose last probe is older than this is stale
    pub stale_cutoff: Duration,
    /// Window in which failed probes are counted
    pub fail_window: Duration,
    /// Failed probes within the window that mark a station failing
    pub fail_limit: i64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            stale_cutoff: Duration::hours(24),
            fail_window: Duration::hours(6),
            fail_limit: 3,
        }
    }
}

/// Health classification of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Never probed, or not probed within the stale cutoff
    Stale,
    /// Too many failed probes in the failure window
    Failing,
    /// Both stale and failing, or the evaluation itself failed
    Unhealthy,
}

impl HealthState {
    /// Whether the dashboard should flag the station.
    pub fn is_unhealthy(self) -> bool {
        self != HealthState::Healthy
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Healthy => "healthy",
            HealthState::Stale => "stale",
            HealthState::Failing => "failing",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Inputs and verdicts of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub last_probe_at: Option<DateTime<Utc>>,
    pub recent_failures: i64,
    pub is_stale: bool,
    pub is_failing: bool,
}

impl Assessment {
    pub fn state(&self) -> HealthState {
        match (self.is_stale, self.is_failing) {
            (false, false) => HealthState::Healthy,
            (true, false) => HealthState::Stale,
            (false, true) => HealthState::Failing,
            (true, true) => HealthState::Unhealthy,
        }
    }

    /// Human-readable reasons, joined with `"; "`.
    pub fn summary(&self, policy: &HealthPolicy) -> String {
        let mut reasons = Vec::new();

        if self.last_probe_at.is_none() {
            reasons.push("No pings yet".to_string());
        } else if self.is_stale {
            reasons.push(format!("Stale (>{}h)", policy.stale_cutoff.num_hours()));
        }
        if self.recent_failures > 0 {
            reasons.push(format!(
                "Recent failures: {} in {}h",
                self.recent_failures,
                policy.fail_window.num_hours()
            ));
        }

        reasons.join("; ")
    }
}

/// Health of one station as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StationHealth {
    pub station_id: i64,
    pub name: String,
    pub state: HealthState,
    pub summary: String,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Classifies stations from their probe history.
#[derive(Clone)]
pub struct HealthEvaluator {
    store: Arc<Store>,
    policy: HealthPolicy,
}

impl HealthEvaluator {
    pub fn new(store: Arc<Store>, policy: HealthPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Evaluate a station as of `now`.
    pub fn assess(&self, station_id: i64, now: DateTime<Utc>) -> Result<Assessment, DbError> {
        let last_probe_at = self.store.latest_probe(station_id)?.map(|p| p.timestamp);
        let recent_failures = self
            .store
            .count_failures_since(station_id, now - self.policy.fail_window)?;

        let is_stale = match last_probe_at {
            None => true,
            Some(at) => at < now - self.policy.stale_cutoff,
        };

        Ok(Assessment {
            last_probe_at,
            recent_failures,
            is_stale,
            is_failing: recent_failures >= self.policy.fail_limit,
        })
    }

    /// Classify a station now.
    pub fn classify(&self, station_id: i64) -> HealthState {
        self.classify_at(station_id, Utc::now())
    }

    /// Classify a station as of `now`. A failed evaluation is `Unhealthy`.
    pub fn classify_at(&self, station_id: i64, now: DateTime<Utc>) -> HealthState {
        match self.assess(station_id, now) {
            Ok(assessment) => assessment.state(),
            Err(e) => {
                tracing::error!("Health evaluation failed for station {}: {}", station_id, e);
                HealthState::Unhealthy
            }
        }
    }

    /// Reasons a station is flagged; empty when there is nothing to report.
    pub fn status_summary(&self, station_id: i64) -> String {
        self.status_summary_at(station_id, Utc::now())
    }

    /// Like [`status_summary`](Self::status_summary), as of `now`.
    pub fn status_summary_at(&self, station_id: i64, now: DateTime<Utc>) -> String {
        match self.assess(station_id, now) {
            Ok(assessment) => assessment.summary(&self.policy),
            Err(e) => {
                tracing::error!("Health summary failed for station {}: {}", station_id, e);
                STATUS_UNAVAILABLE.to_string()
            }
        }
    }

    /// Health of every station, in station order.
    pub fn dashboard(&self, now: DateTime<Utc>) -> Result<Vec<StationHealth>, DbError> {
        let stations = self.store.get_stations()?;
        Ok(stations.iter().map(|s| self.station_health(s, now)).collect())
    }

    fn station_health(&self, station: &Station, now: DateTime<Utc>) -> StationHealth {
        let (state, summary, last_probe_at) = match self.assess(station.id, now) {
            Ok(a) => (a.state(), a.summary(&self.policy), a.last_probe_at),
            Err(e) => {
                tracing::error!("Health evaluation failed for {}: {}", station.display_name(), e);
                (HealthState::Unhealthy, STATUS_UNAVAILABLE.to_string(), None)
            }
        };

        StationHealth {
            station_id: station.id,
            name: station.display_name(),
            state,
            summary,
            last_probe_at,
        }
    }
}

/// Keep only the stations the dashboard should flag.
pub fn unhealthy(entries: Vec<StationHealth>) -> Vec<StationHealth> {
    entries.into_iter().filter(|e| e.state.is_unhealthy()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProbeSample;
    use tempfile::NamedTempFile;

    struct Fixture {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        evaluator: HealthEvaluator,
        station_id: i64,
    }

    fn fixture() -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut station = Station {
            name: "Ridge Top".to_string(),
            ip_address: "10.20.0.4".to_string(),
            ..Default::default()
        };
        let station_id = store.add_station(&mut station).unwrap();
        let evaluator = HealthEvaluator::new(store.clone(), HealthPolicy::default());
        Fixture {
            _tmp: tmp,
            store,
            evaluator,
            station_id,
        }
    }

    fn probe(f: &Fixture, at: DateTime<Utc>, success: bool) {
        let sample = ProbeSample {
            timestamp: at,
            success,
            latency_ms: success.then_some(20),
        };
        f.store.append_probe(f.station_id, &sample).unwrap();
    }

    #[test]
    fn test_no_probes_is_unhealthy() {
        let f = fixture();
        let now = Utc::now();

        let state = f.evaluator.classify_at(f.station_id, now);
        assert_eq!(state, HealthState::Stale);
        assert!(state.is_unhealthy());
        assert_eq!(f.evaluator.status_summary_at(f.station_id, now), "No pings yet");
    }

    #[test]
    fn test_stale_boundary() {
        let f = fixture();
        let now = Utc::now();

        probe(&f, now - Duration::hours(24) - Duration::seconds(1), true);
        let a = f.evaluator.assess(f.station_id, now).unwrap();
        assert!(a.is_stale);
        assert_eq!(a.summary(f.evaluator.policy()), "Stale (>24h)");

        probe(&f, now - Duration::hours(23) - Duration::minutes(59), true);
        let a = f.evaluator.assess(f.station_id, now).unwrap();
        assert!(!a.is_stale);
        assert_eq!(a.state(), HealthState::Healthy);
        assert_eq!(a.summary(f.evaluator.policy()), "");
    }

    #[test]
    fn test_fail_limit() {
        let f = fixture();
        let now = Utc::now();

        probe(&f, now - Duration::hours(5), false);
        probe(&f, now - Duration::hours(2), false);
        let a = f.evaluator.assess(f.station_id, now).unwrap();
        assert_eq!(a.recent_failures, 2);
        assert!(!a.is_failing);
        // Two failures: only staleness decides, and the last probe is recent.
        assert_eq!(a.state(), HealthState::Healthy);
        assert_eq!(a.summary(f.evaluator.policy()), "Recent failures: 2 in 6h");

        probe(&f, now - Duration::hours(1), false);
        let a = f.evaluator.assess(f.station_id, now).unwrap();
        assert_eq!(a.recent_failures, 3);
        assert!(a.is_failing);
        assert_eq!(f.evaluator.classify_at(f.station_id, now), HealthState::Failing);
    }

    #[test]
    fn test_mixed_history_scenario() {
        let f = fixture();
        let now = Utc::now();

        probe(&f, now - Duration::hours(25), true);
        probe(&f, now - Duration::hours(5), false);
        probe(&f, now - Duration::hours(3), false);
        probe(&f, now - Duration::hours(1), true);

        let a = f.evaluator.assess(f.station_id, now).unwrap();
        assert_eq!(a.recent_failures, 2);
        assert!(!a.is_stale);
        assert_eq!(a.last_probe_at, Some(now - Duration::hours(1)));
        assert_eq!(f.evaluator.classify_at(f.station_id, now), HealthState::Healthy);
    }

    #[test]
    fn test_stale_and_failing() {
        let f = fixture();
        let now = Utc::now();
        let policy = HealthPolicy {
            stale_cutoff: Duration::hours(1),
            ..HealthPolicy::default()
        };
        let evaluator = HealthEvaluator::new(f.store.clone(), policy);

        for hours in [5, 4, 3] {
            probe(&f, now - Duration::hours(hours), false);
        }

        assert_eq!(evaluator.classify_at(f.station_id, now), HealthState::Unhealthy);
        assert_eq!(
            evaluator.status_summary_at(f.station_id, now),
            "Stale (>1h); Recent failures: 3 in 6h"
        );
    }

    #[test]
    fn test_classify_is_idempotent() {
        let f = fixture();
        let now = Utc::now();
        probe(&f, now - Duration::hours(2), false);
        probe(&f, now - Duration::minutes(10), true);

        let first = f.evaluator.assess(f.station_id, now).unwrap();
        let second = f.evaluator.assess(f.station_id, now).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            f.evaluator.classify_at(f.station_id, now),
            f.evaluator.classify_at(f.station_id, now)
        );
    }

    #[test]
    fn test_health_independent_of_series() {
        let f = fixture();
        let now = Utc::now();
        f.store
            .append_measurement(f.station_id, "Battery", 12.8, now - Duration::hours(1))
            .unwrap();

        assert!(f.evaluator.classify_at(f.station_id, now).is_unhealthy());
        assert_eq!(f.evaluator.status_summary_at(f.station_id, now), "No pings yet");
        let series = f.store.series(f.station_id, "Battery", now - Duration::hours(2)).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_dashboard_flags_unhealthy() {
        let f = fixture();
        let now = Utc::now();
        let mut other = Station {
            name: String::new(),
            ip_address: "10.20.0.5".to_string(),
            ..Default::default()
        };
        let other_id = f.store.add_station(&mut other).unwrap();
        probe(&f, now - Duration::minutes(5), true);

        let board = f.evaluator.dashboard(now).unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].state, HealthState::Healthy);

        let flagged = unhealthy(board);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].station_id, other_id);
        assert_eq!(flagged[0].name, format!("Station {}", other_id));
        assert_eq!(flagged[0].summary, "No pings yet");
    }
}
