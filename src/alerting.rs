//! Alert evaluation and notification.
//!
//! Three conditions are checked per station: consecutive failed pings, a gap
//! in incoming readings, and the latest reading of a parameter falling
//! outside its configured range. Each alert carries a key; a key is
//! notified once while its condition holds and re-armed once it clears.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::db::{DbError, Station, Store};

const DEFAULT_PING_FAILURES: u32 = 3;
const DEFAULT_GAP_HOURS: u32 = 6;
/// How far back readings are considered when looking for the latest ones.
const READING_LOOKBACK_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Medium => f.write_str("MEDIUM"),
            Severity::High => f.write_str("HIGH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub key: String,
    pub station_id: i64,
    pub severity: Severity,
    pub title: String,
    pub body: String,
}

/// Allowed `[min, max]` range per parameter; `None` leaves a side open.
pub type Thresholds = BTreeMap<String, (Option<f64>, Option<f64>)>;

/// Parse a station's threshold JSON, e.g. `{"Battery": [11.5, 14.5]}`.
///
/// Entries that are not two-element arrays are skipped, and bounds that are
/// neither numbers nor numeric strings are treated as open. Anything that
/// is not a JSON object yields no thresholds.
pub fn parse_thresholds(raw: &str) -> Thresholds {
    if raw.trim().is_empty() {
        return Thresholds::new();
    }

    let map = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!("Ignoring unparseable alert thresholds: {}", raw);
            return Thresholds::new();
        }
    };

    map.into_iter()
        .filter_map(|(name, bounds)| match bounds {
            Value::Array(pair) if pair.len() == 2 => Some((name, (bound(&pair[0]), bound(&pair[1])))),
            _ => None,
        })
        .collect()
}

fn bound(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Evaluates alert conditions and notifies on new ones.
pub struct AlertManager {
    store: Arc<Store>,
    webhook: Option<String>,
    client: reqwest::Client,
    /// Notified keys still active, with their station
    sent: HashMap<String, i64>,
}

impl AlertManager {
    pub fn new(store: Arc<Store>, webhook: Option<String>) -> Self {
        Self {
            store,
            webhook,
            client: reqwest::Client::new(),
            sent: HashMap::new(),
        }
    }

    /// Every alert condition currently true, sent before or not.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, DbError> {
        self.evaluate_all(now).map(|(alerts, _)| alerts)
    }

    /// Alerts plus the ids of stations whose evaluation failed.
    fn evaluate_all(&self, now: DateTime<Utc>) -> Result<(Vec<Alert>, HashSet<i64>), DbError> {
        let mut alerts = Vec::new();
        let mut failed = HashSet::new();

        for station in self.store.get_stations()? {
            if let Err(e) = self.evaluate_station(&station, now, &mut alerts) {
                tracing::error!("AlertManager: failed to evaluate {}: {}", station.display_name(), e);
                failed.insert(station.id);
            }
        }

        Ok((alerts, failed))
    }

    fn evaluate_station(&self, station: &Station, now: DateTime<Utc>, alerts: &mut Vec<Alert>) -> Result<(), DbError> {
        let name = station.display_name();

        let fail_limit = station.alert_ping_failures.unwrap_or(DEFAULT_PING_FAILURES);
        if fail_limit > 0 {
            let failures = self.store.consecutive_failures(station.id, fail_limit)?;
            if failures >= fail_limit {
                alerts.push(Alert {
                    key: format!("pingfail:{}:{}", station.id, failures),
                    station_id: station.id,
                    severity: Severity::High,
                    title: format!("[StatMon] Ping failure: {}", name),
                    body: format!(
                        "{} has {} consecutive failed pings (threshold {}).",
                        name, failures, fail_limit
                    ),
                });
            }
        }

        let latest = self
            .store
            .latest_measurements(station.id, now - Duration::days(READING_LOOKBACK_DAYS))?;

        let gap_hours = station.alert_gap_hours.unwrap_or(DEFAULT_GAP_HOURS);
        let last_reading = latest.values().map(|(_, at)| *at).max();
        let gap_exceeded = match last_reading {
            None => true,
            Some(at) => now - at > Duration::hours(i64::from(gap_hours)),
        };
        if gap_exceeded {
            let detail = match last_reading {
                None => "no data found".to_string(),
                Some(at) => format!("last at {}", at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            };
            alerts.push(Alert {
                key: format!("gap:{}:{}", station.id, gap_hours),
                station_id: station.id,
                severity: Severity::Medium,
                title: format!("[StatMon] Data gap: {}", name),
                body: format!("{} has a data gap > {}h ({}).", name, gap_hours, detail),
            });
        }

        for (parameter, (min, max)) in parse_thresholds(&station.alert_thresholds) {
            let Some((value, at)) = latest.get(&parameter) else {
                continue;
            };
            let below = min.is_some_and(|min| *value < min);
            let above = max.is_some_and(|max| *value > max);
            if !(below || above) {
                continue;
            }

            let range = format!(
                "[{}, {}]",
                min.map_or("-inf".to_string(), |v| v.to_string()),
                max.map_or("+inf".to_string(), |v| v.to_string())
            );
            let at = at.to_rfc3339_opts(SecondsFormat::Secs, true);
            alerts.push(Alert {
                key: format!("thresh:{}:{}:{}", station.id, parameter, at),
                station_id: station.id,
                severity: Severity::Medium,
                title: format!("[StatMon] Threshold: {}.{}", name, parameter),
                body: format!("{}={} at {} outside {}.", parameter, value, at, range),
            });
        }

        Ok(())
    }

    /// Evaluate and notify alerts not already sent. Returns the new alerts.
    ///
    /// Keys whose condition no longer holds are forgotten, so a station that
    /// recovers and fails again alerts again. Stations that could not be
    /// evaluated keep their keys.
    pub async fn run(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let (alerts, failed) = match self.evaluate_all(now) {
            Ok(evaluated) => evaluated,
            Err(e) => {
                tracing::error!("AlertManager: evaluation failed: {}", e);
                return Vec::new();
            }
        };

        let active: HashSet<&str> = alerts.iter().map(|a| a.key.as_str()).collect();
        self.sent
            .retain(|key, station_id| active.contains(key.as_str()) || failed.contains(station_id));

        let mut fresh = Vec::new();
        for alert in alerts {
            if self.sent.insert(alert.key.clone(), alert.station_id).is_some() {
                continue;
            }
            self.notify(&alert).await;
            fresh.push(alert);
        }

        tracing::info!("Alert evaluation complete ({} new).", fresh.len());
        fresh
    }

    async fn notify(&self, alert: &Alert) {
        tracing::warn!("ALERT ({}): {} :: {}", alert.severity, alert.title, alert.body);

        let Some(url) = &self.webhook else {
            return;
        };

        let card = serde_json::json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "summary": alert.title,
            "themeColor": match alert.severity {
                Severity::High => "D13438",
                Severity::Medium => "FFA500",
            },
            "title": alert.title,
            "text": alert.body,
        });

        let result = self
            .client
            .post(url)
            .timeout(std::time::Duration::from_secs(10))
            .json(&card)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(e) = result {
            tracing::error!("Failed sending webhook alert for {}: {}", alert.key, e);
        }
    }
}
