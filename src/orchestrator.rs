/*!
 * Stability orchestrator
 *
 * Polls every registered health source on a fixed interval and folds the
 * reports into an overall status. A regression into critical or emergency
 * territory triggers one full recovery; every change of overall status is
 * broadcast to subscribers.
 */

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_core_resilience::{
    HealthMonitor, HealthSnapshot, HealthSource, HealthStatus, OverallHealth, SubsystemHealth,
};

use crate::recovery::{ErrorRecoveryEscalator, RecoveryCategory};

/// Orchestrator tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Default timeout for `wait_for_stability`
    #[serde(default = "default_stability_timeout_secs")]
    pub stability_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stability_timeout_secs: default_stability_timeout_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_secs(self.stability_timeout_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_stability_timeout_secs() -> u64 {
    30
}

/// Broadcast whenever the overall status changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthChange {
    pub sequence: u64,
    pub previous: OverallHealth,
    pub current: OverallHealth,
}

/// Feature switches derived from the latest health snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptimizedConfig {
    pub hardware_rendering: bool,
    pub preloading: bool,
    pub persistent_storage: bool,
}

impl OptimizedConfig {
    fn from_snapshot(snapshot: &HealthSnapshot) -> Self {
        let healthy_or_absent =
            |name: &str| matches!(snapshot.status_of(name), None | Some(HealthStatus::Healthy));

        Self {
            hardware_rendering: snapshot.overall != OverallHealth::Emergency
                && snapshot.status_of("resource_pool") != Some(HealthStatus::Failed),
            preloading: snapshot.overall <= OverallHealth::Degraded
                && healthy_or_absent("asset_tracker"),
            persistent_storage: healthy_or_absent("persistent_store"),
        }
    }
}

impl Default for OptimizedConfig {
    fn default() -> Self {
        Self {
            hardware_rendering: true,
            preloading: true,
            persistent_storage: true,
        }
    }
}

#[derive(Debug)]
struct OrchestratorState {
    monitor: HealthMonitor,
    latest: Option<HealthSnapshot>,
    full_recoveries_triggered: u64,
}

/// Polls health sources and reacts to regressions
#[derive(Clone)]
pub struct StabilityOrchestrator {
    config: Arc<OrchestratorConfig>,
    sources: Arc<Mutex<Vec<Arc<dyn HealthSource>>>>,
    escalator: Option<ErrorRecoveryEscalator>,
    state: Arc<Mutex<OrchestratorState>>,
    changes: broadcast::Sender<HealthChange>,
}

impl std::fmt::Debug for StabilityOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityOrchestrator")
            .field("config", &self.config)
            .field("sources", &self.source_names())
            .finish()
    }
}

impl StabilityOrchestrator {
    pub fn new(config: OrchestratorConfig, escalator: Option<ErrorRecoveryEscalator>) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            config: Arc::new(config),
            sources: Arc::new(Mutex::new(Vec::new())),
            escalator,
            state: Arc::new(Mutex::new(OrchestratorState {
                monitor: HealthMonitor::new(),
                latest: None,
                full_recoveries_triggered: 0,
            })),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, source: Arc<dyn HealthSource>) {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source);
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|source| source.name().to_string())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthChange> {
        self.changes.subscribe()
    }

    /// Run one poll round
    pub async fn poll(&self) -> HealthSnapshot {
        let sources: Vec<Arc<dyn HealthSource>> = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let reports: Vec<SubsystemHealth> = sources.iter().map(|source| source.health()).collect();

        let (snapshot, previous, regressed) = {
            let mut state = self.lock();
            let previous = state.monitor.previous().unwrap_or(OverallHealth::Healthy);
            let regressed = state.monitor.is_regression_to(OverallHealth::classify(
                count_status(&reports, HealthStatus::Failed),
                count_status(&reports, HealthStatus::Degraded),
            ));
            let snapshot = state.monitor.check(reports);
            state.latest = Some(snapshot.clone());
            if regressed {
                state.full_recoveries_triggered += 1;
            }
            (snapshot, previous, regressed)
        };

        debug!(
            sequence = snapshot.sequence,
            overall = snapshot.overall.as_str(),
            failed = snapshot.failed,
            degraded = snapshot.degraded,
            "Health poll"
        );

        if snapshot.overall != previous {
            info!(
                from = previous.as_str(),
                to = snapshot.overall.as_str(),
                "Overall health changed"
            );
            let _ = self.changes.send(HealthChange {
                sequence: snapshot.sequence,
                previous,
                current: snapshot.overall,
            });
        }

        if regressed {
            warn!(
                overall = snapshot.overall.as_str(),
                "Health regressed, running full recovery"
            );
            if let Some(escalator) = &self.escalator {
                escalator.manual_recovery(RecoveryCategory::Full).await;
            }
        }

        snapshot
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.lock().latest.clone()
    }

    /// Full recoveries started because of a regression
    pub fn full_recoveries_triggered(&self) -> u64 {
        self.lock().full_recoveries_triggered
    }

    /// Poll until healthy or until `timeout` elapses
    pub async fn wait_for_stability(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll().await.overall == OverallHealth::Healthy {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    /// Feature switches for the host; everything on before the first poll
    pub fn optimized_config(&self) -> OptimizedConfig {
        self.lock()
            .latest
            .as_ref()
            .map(OptimizedConfig::from_snapshot)
            .unwrap_or_default()
    }

    /// Poll on the configured interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sources = self.source_names().len(),
            interval_ms = self.config.poll_interval_ms,
            "Stability orchestrator started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stability orchestrator stopped");
                        return;
                    }
                }
            }
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

fn count_status(reports: &[SubsystemHealth], status: HealthStatus) -> usize {
    reports.iter().filter(|report| report.status == status).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryConfig;

    /// Health source whose status the test flips
    struct Switch {
        name: &'static str,
        status: Mutex<HealthStatus>,
    }

    impl Switch {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                status: Mutex::new(HealthStatus::Healthy),
            })
        }

        fn set(&self, status: HealthStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    impl HealthSource for Switch {
        fn name(&self) -> &str {
            self.name
        }

        fn health(&self) -> SubsystemHealth {
            SubsystemHealth::new(self.name, *self.status.lock().unwrap(), "")
        }
    }

    fn orchestrator() -> (StabilityOrchestrator, ErrorRecoveryEscalator) {
        let escalator = ErrorRecoveryEscalator::new(RecoveryConfig::default(), Arc::new(|| {}));
        let orchestrator =
            StabilityOrchestrator::new(OrchestratorConfig::default(), Some(escalator.clone()));
        (orchestrator, escalator)
    }

    #[tokio::test]
    async fn test_regression_triggers_single_full_recovery() {
        let (orchestrator, escalator) = orchestrator();
        let store = Switch::new("persistent_store");
        let pool = Switch::new("resource_pool");
        orchestrator.register(store.clone());
        orchestrator.register(pool.clone());

        assert_eq!(orchestrator.poll().await.overall, OverallHealth::Healthy);

        pool.set(HealthStatus::Failed);
        assert_eq!(orchestrator.poll().await.overall, OverallHealth::Critical);
        assert_eq!(orchestrator.poll().await.overall, OverallHealth::Critical);
        assert_eq!(orchestrator.full_recoveries_triggered(), 1);
        assert_eq!(escalator.stats().full_recoveries, 1);

        store.set(HealthStatus::Failed);
        assert_eq!(orchestrator.poll().await.overall, OverallHealth::Emergency);
        assert_eq!(orchestrator.full_recoveries_triggered(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let (orchestrator, _) = orchestrator();
        let assets = Switch::new("asset_tracker");
        orchestrator.register(assets.clone());
        let mut changes = orchestrator.subscribe();

        orchestrator.poll().await;
        assert!(changes.try_recv().is_err());

        assets.set(HealthStatus::Degraded);
        orchestrator.poll().await;
        let change = changes.try_recv().unwrap();
        assert_eq!(change.previous, OverallHealth::Healthy);
        assert_eq!(change.current, OverallHealth::Degraded);

        orchestrator.poll().await;
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_optimized_config() {
        let (orchestrator, _) = orchestrator();
        assert_eq!(orchestrator.optimized_config(), OptimizedConfig::default());

        let store = Switch::new("persistent_store");
        let assets = Switch::new("asset_tracker");
        let pool = Switch::new("resource_pool");
        orchestrator.register(store.clone());
        orchestrator.register(assets.clone());
        orchestrator.register(pool.clone());

        store.set(HealthStatus::Degraded);
        orchestrator.poll().await;
        let config = orchestrator.optimized_config();
        assert!(!config.persistent_storage);
        assert!(config.preloading);
        assert!(config.hardware_rendering);

        pool.set(HealthStatus::Failed);
        assets.set(HealthStatus::Degraded);
        orchestrator.poll().await;
        let config = orchestrator.optimized_config();
        assert!(!config.hardware_rendering);
        assert!(!config.preloading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_stability() {
        let (orchestrator, _) = orchestrator();
        let store = Switch::new("persistent_store");
        orchestrator.register(store.clone());
        store.set(HealthStatus::Degraded);

        assert!(!orchestrator.wait_for_stability(Duration::from_secs(25)).await);

        let healer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(15)).await;
                store.set(HealthStatus::Healthy);
            })
        };
        assert!(orchestrator.wait_for_stability(Duration::from_secs(60)).await);
        healer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_shutdown() {
        let (orchestrator, _) = orchestrator();
        orchestrator.register(Switch::new("persistent_store"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        // Ticks at 0s, 10s and 20s
        assert_eq!(orchestrator.latest().map(|s| s.sequence), Some(3));
    }
}
