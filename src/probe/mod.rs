//! Probe module for station reachability.
//!
//! A probe never fails from the caller's point of view: timeouts,
//! unreachable hosts and a broken ping mechanism all come back as a failed
//! sample, with the cause kept alongside for logging.

mod ping;

pub use ping::*;

use chrono::Utc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::PingSettings;
use crate::db::{ProbeSample, Station};

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    /// True when the probing machinery itself misbehaved, as opposed to the
    /// station simply not answering.
    pub fn is_mechanism_failure(&self) -> bool {
        matches!(
            self,
            ProbeError::Permission(_) | ProbeError::Config(_) | ProbeError::Command(_)
        )
    }
}

/// Result of one probe: the sample to record, plus why it failed.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub sample: ProbeSample,
    pub error: Option<ProbeError>,
}

/// Probe a station once.
///
/// Sends `settings.count` echo requests; the station is up if any of them is
/// answered, and the latency is the mean of the answered round trips. The
/// whole call is capped at `settings.deadline()`.
pub async fn probe_station(station: &Station, settings: &PingSettings) -> ProbeOutcome {
    let address = station.ip_address.trim();
    let deadline = settings.deadline();
    let started = Instant::now();

    let result = if address.is_empty() {
        Err(ProbeError::Config("station has no address".to_string()))
    } else {
        tokio::time::timeout(deadline, run_echoes(address, settings))
            .await
            .unwrap_or(Err(ProbeError::Timeout(deadline)))
    };

    let sample = ProbeSample {
        timestamp: Utc::now(),
        success: result.is_ok(),
        latency_ms: result.as_ref().ok().map(|rtt| round_ms(*rtt)),
    };

    match result {
        Ok(rtt) => {
            tracing::debug!("[{}] {} answered in {:?}", station.display_name(), address, rtt);
            ProbeOutcome { sample, error: None }
        }
        Err(e) => {
            if e.is_mechanism_failure() {
                tracing::warn!("[{}] probe of {:?} could not run: {}", station.display_name(), address, e);
            } else {
                tracing::debug!(
                    "[{}] {} unreachable after {:?}: {}",
                    station.display_name(),
                    address,
                    started.elapsed(),
                    e
                );
            }
            ProbeOutcome { sample, error: Some(e) }
        }
    }
}

async fn run_echoes(address: &str, settings: &PingSettings) -> Result<Duration, ProbeError> {
    let count = settings.count.max(1);
    let mut replies = Vec::with_capacity(count as usize);
    let mut last_error = None;

    for attempt in 0..count {
        if attempt > 0 {
            tokio::time::sleep(settings.interval).await;
        }
        match ping_once(address, settings.timeout, settings.privileged).await {
            Ok(rtt) => replies.push(rtt),
            // Retrying cannot help a broken mechanism or a bad address.
            Err(e) if e.is_mechanism_failure() => return Err(e),
            Err(e) => last_error = Some(e),
        }
    }

    if replies.is_empty() {
        return Err(last_error.unwrap_or(ProbeError::Timeout(settings.timeout)));
    }
    Ok(replies.iter().sum::<Duration>() / replies.len() as u32)
}

/// Round a round-trip time to whole milliseconds.
fn round_ms(rtt: Duration) -> i64 {
    (rtt.as_secs_f64() * 1000.0).round() as i64
}
