//! Probe-and-record entry point for manual and scheduled pings.

use std::sync::Arc;
use thiserror::Error;

use crate::config::PingSettings;
use crate::db::{DbError, ProbeResult, Station, Store};
use crate::probe::{probe_station, ProbeOutcome};

/// The probe ran but its result could not be written.
///
/// The outcome is kept so the caller can retry
/// [`Store::append_probe`] without probing again.
#[derive(Error, Debug)]
#[error("failed to record probe for station {station_id}: {source}")]
pub struct RecordError {
    pub station_id: i64,
    pub outcome: ProbeOutcome,
    #[source]
    pub source: DbError,
}

/// Probes stations and appends the results to the ledger.
#[derive(Clone)]
pub struct Monitor {
    store: Arc<Store>,
    base_settings: PingSettings,
}

impl Monitor {
    pub fn new(store: Arc<Store>, base_settings: PingSettings) -> Self {
        Self { store, base_settings }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Ping settings with the database overrides applied. Falls back to the
    /// base settings when the settings table cannot be read.
    pub fn ping_settings(&self) -> PingSettings {
        match self.store.get_settings() {
            Ok(kv) => self.base_settings.clone().with_overrides(&kv),
            Err(e) => {
                tracing::warn!("Could not load ping settings, using defaults: {}", e);
                self.base_settings.clone()
            }
        }
    }

    /// Probe a station once and record the result.
    pub async fn probe(&self, station: &Station) -> Result<ProbeResult, RecordError> {
        let settings = self.ping_settings();
        self.probe_with(station, &settings).await
    }

    /// Probe with explicit settings, so a cycle reads them only once.
    pub async fn probe_with(&self, station: &Station, settings: &PingSettings) -> Result<ProbeResult, RecordError> {
        let outcome = probe_station(station, settings).await;
        self.record(station.id, outcome)
    }

    /// Append an outcome that was already probed.
    pub fn record(&self, station_id: i64, outcome: ProbeOutcome) -> Result<ProbeResult, RecordError> {
        match self.store.append_probe(station_id, &outcome.sample) {
            Ok(result) => Ok(result),
            Err(source) => Err(RecordError {
                station_id,
                outcome,
                source,
            }),
        }
    }
}
