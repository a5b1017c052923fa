//! Configuration module for StatMon.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Ping settings can additionally be overridden at runtime from the
//! database `settings` table.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::health::HealthPolicy;

/// Largest accepted echo count.
pub const MAX_PING_COUNT: u32 = 100;
/// Largest accepted per-echo timeout or inter-echo interval, in seconds.
pub const MAX_PING_SECONDS: f64 = 60.0;

/// Settings for a single ping invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PingSettings {
    /// Echo requests per probe
    pub count: u32,
    /// Delay between echo requests when `count > 1`
    pub interval: Duration,
    /// Per-echo reply timeout
    pub timeout: Duration,
    /// Try RAW ICMP sockets before unprivileged ones
    pub privileged: bool,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            count: 1,
            interval: Duration::from_millis(800),
            timeout: Duration::from_secs(1),
            privileged: false,
        }
    }
}

impl PingSettings {
    /// Apply overrides from the `settings` table.
    ///
    /// Keys: `PING_COUNT`, `PING_INTERVAL_SEC`, `PING_TIMEOUT_SEC`,
    /// `PING_PRIVILEGED`. A value that fails to parse leaves the current
    /// setting untouched; values above [`MAX_PING_COUNT`] or
    /// [`MAX_PING_SECONDS`] are clamped.
    pub fn with_overrides(mut self, kv: &HashMap<String, String>) -> Self {
        if let Some(count) = kv.get("PING_COUNT").and_then(|v| v.trim().parse::<u32>().ok()) {
            if count > 0 {
                self.count = count.min(MAX_PING_COUNT);
            }
        }
        if let Some(interval) = kv.get("PING_INTERVAL_SEC").and_then(|v| parse_seconds(v)) {
            self.interval = interval;
        }
        if let Some(timeout) = kv.get("PING_TIMEOUT_SEC").and_then(|v| parse_seconds(v)) {
            if !timeout.is_zero() {
                self.timeout = timeout;
            }
        }
        if let Some(privileged) = kv.get("PING_PRIVILEGED") {
            self.privileged = parse_flag(privileged);
        }
        self
    }

    /// Upper bound on the wall-clock time of one probe: every echo timing
    /// out, plus the gaps between echoes, plus a fixed second of overhead.
    /// Saturates at `Duration::MAX`.
    pub fn deadline(&self) -> Duration {
        let count = self.count.max(1);
        self.timeout
            .checked_mul(count)
            .and_then(|echoes| {
                self.interval
                    .checked_mul(count - 1)
                    .and_then(|gaps| echoes.checked_add(gaps))
            })
            .and_then(|total| total.checked_add(Duration::from_secs(1)))
            .unwrap_or(Duration::MAX)
    }
}

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Path to the SQLite database file (default: "statmon.db")
    pub db_path: String,
    /// Time between auto-ping cycles (default: 5 minutes)
    pub ping_interval: Duration,
    /// Time between alert evaluations (default: 5 minutes)
    pub alert_interval: Duration,
    /// Stations probed at the same time (default: 8)
    pub ping_concurrency: usize,
    /// Base ping settings before database overrides
    pub ping: PingSettings,
    /// Health thresholds
    pub health: HealthPolicy,
    /// Webhook that receives alert cards (default: unset)
    pub alert_webhook: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "statmon.db".to_string(),
            ping_interval: Duration::from_secs(300),
            alert_interval: Duration::from_secs(300),
            ping_concurrency: 8,
            ping: PingSettings::default(),
            health: HealthPolicy::default(),
            alert_webhook: None,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STATMON_DB_PATH`: Database file path (default: "statmon.db")
    /// - `STATMON_PING_INTERVAL_SEC`: seconds between ping cycles (default: 300)
    /// - `STATMON_ALERT_INTERVAL_SEC`: seconds between alert runs (default: 300)
    /// - `STATMON_PING_CONCURRENCY`: parallel probes (default: 8)
    /// - `STATMON_PING_COUNT`: echoes per probe (default: 1)
    /// - `STATMON_PING_TIMEOUT_SEC`: per-echo timeout (default: 1.0)
    /// - `STATMON_PING_PRIVILEGED`: use RAW sockets (default: false)
    /// - `STATMON_STALE_CUTOFF_HOURS`: hours before a station is stale (default: 24)
    /// - `STATMON_FAIL_WINDOW_HOURS`: failure counting window (default: 6)
    /// - `STATMON_FAIL_LIMIT`: failures in the window that mark a station failing (default: 3)
    /// - `STATMON_ALERT_WEBHOOK`: alert webhook URL (default: unset)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("STATMON_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(secs) = env_parse::<u64>("STATMON_PING_INTERVAL_SEC").filter(|s| *s > 0) {
            cfg.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STATMON_ALERT_INTERVAL_SEC").filter(|s| *s > 0) {
            cfg.alert_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("STATMON_PING_CONCURRENCY").filter(|n| *n > 0) {
            cfg.ping_concurrency = n;
        }
        if let Some(count) = env_parse::<u32>("STATMON_PING_COUNT").filter(|c| *c > 0) {
            cfg.ping.count = count.min(MAX_PING_COUNT);
        }
        if let Some(timeout) = env::var("STATMON_PING_TIMEOUT_SEC").ok().and_then(|v| parse_seconds(&v)) {
            cfg.ping.timeout = timeout;
        }
        if let Ok(flag) = env::var("STATMON_PING_PRIVILEGED") {
            cfg.ping.privileged = parse_flag(&flag);
        }
        if let Some(hours) = env_parse::<i64>("STATMON_STALE_CUTOFF_HOURS").filter(|h| *h > 0) {
            cfg.health.stale_cutoff = chrono::Duration::hours(hours);
        }
        if let Some(hours) = env_parse::<i64>("STATMON_FAIL_WINDOW_HOURS").filter(|h| *h > 0) {
            cfg.health.fail_window = chrono::Duration::hours(hours);
        }
        if let Some(limit) = env_parse::<i64>("STATMON_FAIL_LIMIT").filter(|l| *l > 0) {
            cfg.health.fail_limit = limit;
        }
        if let Ok(url) = env::var("STATMON_ALERT_WEBHOOK") {
            if !url.trim().is_empty() {
                cfg.alert_webhook = Some(url.trim().to_string());
            }
        }

        cfg
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    if secs > MAX_PING_SECONDS {
        tracing::warn!("Clamping {}s to {}s", secs, MAX_PING_SECONDS);
    }
    Duration::try_from_secs_f64(secs.min(MAX_PING_SECONDS)).ok()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
