//! Scheduler module for periodic pinging and alerting.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::alerting::AlertManager;
use crate::config::MonitorConfig;
use crate::health::{unhealthy, HealthEvaluator};
use crate::monitor::Monitor;

/// Tally of one auto-ping cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub reachable: usize,
    pub unreachable: usize,
    /// Probes whose result could not be written
    pub unrecorded: usize,
}

/// Drives the auto-ping and alert loops.
pub struct Scheduler {
    monitor: Monitor,
    evaluator: HealthEvaluator,
    alert_manager: Arc<Mutex<AlertManager>>,
    ping_interval: Duration,
    alert_interval: Duration,
    concurrency: usize,
    stop: broadcast::Sender<()>,
    loops: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        monitor: Monitor,
        evaluator: HealthEvaluator,
        alert_manager: AlertManager,
        cfg: &MonitorConfig,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            monitor,
            evaluator,
            alert_manager: Arc::new(Mutex::new(alert_manager)),
            ping_interval: cfg.ping_interval,
            alert_interval: cfg.alert_interval,
            concurrency: cfg.ping_concurrency.max(1),
            stop,
            loops: Vec::new(),
        }
    }

    /// Spawn the ping and alert loops.
    pub fn start(&mut self) {
        tracing::info!(
            "Scheduler: pinging every {:?}, alerting every {:?}",
            self.ping_interval,
            self.alert_interval
        );

        let monitor = self.monitor.clone();
        let concurrency = self.concurrency;
        let mut stop_rx = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.loops.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        run_ping_cycle(&monitor, concurrency).await;
                    }
                }
            }
        }));

        let evaluator = self.evaluator.clone();
        let alert_manager = self.alert_manager.clone();
        let mut stop_rx = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.alert_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.loops.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        alert_manager.lock().await.run(now).await;
                        log_dashboard(&evaluator, now);
                    }
                }
            }
        }));
    }

    /// Stop both loops and wait for them. A cycle already running finishes
    /// first, so its results are recorded.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        for handle in self.loops {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler loop ended abnormally: {}", e);
            }
        }
    }
}

/// Probe every active station once, at most `concurrency` at a time.
pub async fn run_ping_cycle(monitor: &Monitor, concurrency: usize) -> CycleReport {
    let mut report = CycleReport::default();

    let stations = match monitor.store().get_active_stations() {
        Ok(stations) => stations,
        Err(e) => {
            tracing::error!("Auto-ping: failed to load stations: {}", e);
            return report;
        }
    };
    if stations.is_empty() {
        tracing::warn!("No stations configured for auto-ping.");
        return report;
    }

    // Read once per cycle so operator changes apply without a restart.
    let settings = Arc::new(monitor.ping_settings());
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    tracing::info!("Auto-ping cycle started for {} station(s).", stations.len());

    let mut tasks = JoinSet::new();
    for station in stations {
        let monitor = monitor.clone();
        let settings = settings.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let name = station.display_name();

            match monitor.probe_with(&station, &settings).await {
                Ok(result) if result.success => {
                    tracing::info!(
                        "[{}] {} - Ping OK ({} ms)",
                        name,
                        station.ip_address,
                        result.latency_ms.unwrap_or_default()
                    );
                    Ok(true)
                }
                Ok(_) => {
                    tracing::warn!("[{}] {} - Ping FAILED", name, station.ip_address);
                    Ok(false)
                }
                Err(e) => {
                    tracing::error!("[{}] {}", name, e);
                    Err(e)
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(true)) => report.reachable += 1,
            Ok(Ok(false)) => report.unreachable += 1,
            Ok(Err(_)) => report.unrecorded += 1,
            Err(e) => {
                tracing::error!("Auto-ping task panicked: {}", e);
                report.unrecorded += 1;
            }
        }
    }

    tracing::info!(
        "Auto-ping cycle complete: {} ok, {} failed, {} unrecorded.",
        report.reachable,
        report.unreachable,
        report.unrecorded
    );
    report
}

fn log_dashboard(evaluator: &HealthEvaluator, now: chrono::DateTime<Utc>) {
    let board = match evaluator.dashboard(now) {
        Ok(board) => board,
        Err(e) => {
            tracing::error!("Dashboard: failed to evaluate stations: {}", e);
            return;
        }
    };

    let total = board.len();
    let flagged = unhealthy(board);
    tracing::info!("Dashboard: {} of {} station(s) unhealthy.", flagged.len(), total);
    for entry in &flagged {
        tracing::info!("  [{}] {}: {}", entry.name, entry.state, entry.summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PingSettings;
    use crate::db::{Station, Store};
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_cycle_probes_only_active_stations() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        let mut active = Station {
            name: "Loopback".to_string(),
            ip_address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        let mut inactive = Station {
            name: "Retired".to_string(),
            ip_address: "127.0.0.1".to_string(),
            active: false,
            ..Default::default()
        };
        let mut unaddressed = Station {
            name: "Unaddressed".to_string(),
            ..Default::default()
        };
        store.add_station(&mut active).unwrap();
        store.add_station(&mut inactive).unwrap();
        store.add_station(&mut unaddressed).unwrap();

        let monitor = Monitor::new(store.clone(), PingSettings::default());
        let report = run_ping_cycle(&monitor, 4).await;

        assert_eq!(report.reachable + report.unreachable, 1);
        assert_eq!(report.unrecorded, 0);
        assert!(store.latest_probe(active.id).unwrap().is_some());
        assert!(store.latest_probe(inactive.id).unwrap().is_none());
        assert!(store.latest_probe(unaddressed.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_cycle() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut station = Station {
            name: "Loopback".to_string(),
            ip_address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        store.add_station(&mut station).unwrap();

        let cfg = MonitorConfig {
            ping_interval: Duration::from_secs(3600),
            alert_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let monitor = Monitor::new(store.clone(), PingSettings::default());
        let evaluator = HealthEvaluator::new(store.clone(), cfg.health.clone());
        let alert_manager = AlertManager::new(store.clone(), None);
        let mut scheduler = Scheduler::new(monitor, evaluator, alert_manager, &cfg);

        // The first tick fires at once; stop while that cycle is probing.
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(10), scheduler.stop())
            .await
            .unwrap();

        assert!(store.latest_probe(station.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let monitor = Monitor::new(store, PingSettings::default());

        assert_eq!(run_ping_cycle(&monitor, 1).await, CycleReport::default());
    }
}
