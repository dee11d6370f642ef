/*!
 * Error recovery escalator
 *
 * Errors from every subsystem are routed here by category. Each category
 * counts its errors and, once past the noise floor, runs its registered
 * recovery action with a bounded retry budget. A category that exhausts its
 * budget escalates to a single `full` recovery; if even that fails, the host
 * environment is asked to reload once after a short delay.
 *
 * ```text
 *   Idle ──trigger──▶ Recovering ──ok──▶ Idle
 *                         │
 *                         ├──err, budget left──▶ Idle (Retrying)
 *                         └──err, exhausted────▶ Exhausted ──▶ full
 * ```
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use warden_core_resilience::{HealthSource, HealthStatus, SubsystemHealth};

use crate::error::{Result, WardenError};

/// Error category a recovery action is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryCategory {
    Storage,
    Policy,
    ResourcePool,
    Asset,
    Full,
}

impl RecoveryCategory {
    pub const ALL: [RecoveryCategory; 5] = [
        RecoveryCategory::Storage,
        RecoveryCategory::Policy,
        RecoveryCategory::ResourcePool,
        RecoveryCategory::Asset,
        RecoveryCategory::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryCategory::Storage => "storage",
            RecoveryCategory::Policy => "policy",
            RecoveryCategory::ResourcePool => "resource-pool",
            RecoveryCategory::Asset => "asset",
            RecoveryCategory::Full => "full",
        }
    }
}

impl fmt::Display for RecoveryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category's recovery procedure
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn recover(&self) -> Result<()>;
}

/// Last-resort environment control
pub trait EnvironmentHost: Send + Sync {
    fn reload(&self);
}

impl<F> EnvironmentHost for F
where
    F: Fn() + Send + Sync,
{
    fn reload(&self) {
        self()
    }
}

/// Escalator tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Errors a category must see before recovery runs
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: u32,

    /// Minimum spacing between two triggered recoveries, across categories
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Delay before the environment reload after a failed full recovery
    #[serde(default = "default_reload_delay_ms")]
    pub reload_delay_ms: u64,

    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,

    #[serde(default = "default_policy_retries")]
    pub policy_retries: u32,

    #[serde(default = "default_resource_pool_retries")]
    pub resource_pool_retries: u32,

    #[serde(default = "default_asset_retries")]
    pub asset_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            noise_threshold: default_noise_threshold(),
            debounce_ms: default_debounce_ms(),
            reload_delay_ms: default_reload_delay_ms(),
            storage_retries: default_storage_retries(),
            policy_retries: default_policy_retries(),
            resource_pool_retries: default_resource_pool_retries(),
            asset_retries: default_asset_retries(),
        }
    }
}

impl RecoveryConfig {
    /// Retry budget for a category; full recovery gets a single attempt
    pub fn budget(&self, category: RecoveryCategory) -> u32 {
        match category {
            RecoveryCategory::Storage => self.storage_retries,
            RecoveryCategory::Policy => self.policy_retries,
            RecoveryCategory::ResourcePool => self.resource_pool_retries,
            RecoveryCategory::Asset => self.asset_retries,
            RecoveryCategory::Full => 1,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.noise_threshold == 0 {
            return Err(WardenError::Config(
                "recovery.noise_threshold must be at least 1".to_string(),
            ));
        }
        for category in RecoveryCategory::ALL {
            if self.budget(category) == 0 {
                return Err(WardenError::Config(format!(
                    "recovery budget for {} must be at least 1",
                    category
                )));
            }
        }
        Ok(())
    }
}

fn default_noise_threshold() -> u32 {
    5
}

fn default_debounce_ms() -> u64 {
    30_000
}

fn default_reload_delay_ms() -> u64 {
    5_000
}

fn default_storage_retries() -> u32 {
    3
}

fn default_policy_retries() -> u32 {
    2
}

fn default_resource_pool_retries() -> u32 {
    3
}

fn default_asset_retries() -> u32 {
    2
}

/// Why a trigger did not run recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BelowNoiseFloor,
    Debounced,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Skipped(SkipReason),
    Recovered,
    /// The action failed; this many attempts remain before escalation
    Retrying { remaining: u32 },
    /// Budget exhausted; full recovery ran (or is already running)
    Escalated,
    /// Full recovery failed; the environment reload is pending
    ReloadScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryPhase {
    Idle,
    Recovering,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub errors: u32,
    pub retries: u32,
    pub phase: CategoryPhase,
}

impl Default for CategoryStats {
    fn default() -> Self {
        Self {
            errors: 0,
            retries: 0,
            phase: CategoryPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub total_errors: u64,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    /// Full recoveries run since creation; never reset
    pub full_recoveries: u64,
    pub reload_scheduled: bool,
    pub recovery_rate: f64,
    pub categories: BTreeMap<String, CategoryStats>,
}

#[derive(Debug, Default)]
struct EscalatorState {
    categories: HashMap<RecoveryCategory, CategoryStats>,
    total_errors: u64,
    recovery_attempts: u64,
    successful_recoveries: u64,
    full_recoveries: u64,
    last_recovery: Option<Instant>,
    reload_scheduled: bool,
}

impl EscalatorState {
    fn category(&mut self, category: RecoveryCategory) -> &mut CategoryStats {
        self.categories.entry(category).or_default()
    }

    fn recovery_rate(&self) -> f64 {
        if self.recovery_attempts == 0 {
            1.0
        } else {
            self.successful_recoveries as f64 / self.recovery_attempts as f64
        }
    }
}

/// Routes categorized errors to recovery actions and escalates
#[derive(Clone)]
pub struct ErrorRecoveryEscalator {
    config: Arc<RecoveryConfig>,
    actions: Arc<Mutex<HashMap<RecoveryCategory, Arc<dyn RecoveryAction>>>>,
    environment: Arc<dyn EnvironmentHost>,
    state: Arc<Mutex<EscalatorState>>,
}

impl fmt::Debug for ErrorRecoveryEscalator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecoveryEscalator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ErrorRecoveryEscalator {
    pub fn new(config: RecoveryConfig, environment: Arc<dyn EnvironmentHost>) -> Self {
        Self {
            config: Arc::new(config),
            actions: Arc::new(Mutex::new(HashMap::new())),
            environment,
            state: Arc::new(Mutex::new(EscalatorState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EscalatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the action for a category
    pub fn register_action(&self, category: RecoveryCategory, action: Arc<dyn RecoveryAction>) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, action);
    }

    fn action_for(&self, category: RecoveryCategory) -> Option<Arc<dyn RecoveryAction>> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned()
    }

    /// Count an error and recover if it is past the noise floor
    pub async fn trigger_recovery(&self, category: RecoveryCategory) -> RecoveryOutcome {
        {
            let mut state = self.lock();
            state.total_errors += 1;
            let noise_threshold = self.config.noise_threshold;
            let stats = state.category(category);
            stats.errors += 1;

            if category != RecoveryCategory::Full && stats.errors < noise_threshold {
                debug!(%category, errors = stats.errors, "Error below noise floor");
                return RecoveryOutcome::Skipped(SkipReason::BelowNoiseFloor);
            }

            if let Some(last) = state.last_recovery {
                if last.elapsed() < self.config.debounce() {
                    debug!(%category, "Recovery debounced");
                    return RecoveryOutcome::Skipped(SkipReason::Debounced);
                }
            }
        }

        self.execute(category).await
    }

    /// Recover now, ignoring the noise floor and debounce
    pub async fn manual_recovery(&self, category: RecoveryCategory) -> RecoveryOutcome {
        info!(%category, "Manual recovery requested");
        self.execute(category).await
    }

    async fn execute(&self, category: RecoveryCategory) -> RecoveryOutcome {
        if category == RecoveryCategory::Full {
            return self.run_full().await;
        }

        {
            let mut state = self.lock();
            if state.category(category).phase != CategoryPhase::Idle {
                return RecoveryOutcome::Skipped(SkipReason::InProgress);
            }
            state.recovery_attempts += 1;
            state.last_recovery = Some(Instant::now());
            let stats = state.category(category);
            stats.phase = CategoryPhase::Recovering;
            stats.retries += 1;
        }

        let result = match self.action_for(category) {
            Some(action) => action.recover().await,
            None => Ok(()),
        };

        let remaining = {
            let mut state = self.lock();
            match result {
                Ok(()) => {
                    state.successful_recoveries += 1;
                    *state.category(category) = CategoryStats::default();
                    info!(%category, "Recovery succeeded");
                    return RecoveryOutcome::Recovered;
                }
                Err(ref e) => {
                    let budget = self.config.budget(category);
                    let stats = state.category(category);
                    let remaining = budget.saturating_sub(stats.retries);
                    stats.phase = if remaining == 0 {
                        CategoryPhase::Exhausted
                    } else {
                        CategoryPhase::Idle
                    };
                    warn!(%category, error = %e, remaining, "Recovery attempt failed");
                    remaining
                }
            }
        };

        if remaining > 0 {
            return RecoveryOutcome::Retrying { remaining };
        }

        warn!(%category, "Recovery budget exhausted, escalating to full recovery");
        match self.run_full().await {
            RecoveryOutcome::ReloadScheduled => RecoveryOutcome::ReloadScheduled,
            _ => RecoveryOutcome::Escalated,
        }
    }

    async fn run_full(&self) -> RecoveryOutcome {
        {
            let mut state = self.lock();
            if state.reload_scheduled {
                return RecoveryOutcome::ReloadScheduled;
            }
            if state.category(RecoveryCategory::Full).phase == CategoryPhase::Recovering {
                return RecoveryOutcome::Skipped(SkipReason::InProgress);
            }
            state.recovery_attempts += 1;
            state.full_recoveries += 1;
            state.last_recovery = Some(Instant::now());
            state.category(RecoveryCategory::Full).phase = CategoryPhase::Recovering;
        }

        info!("Running full recovery");
        let result = match self.action_for(RecoveryCategory::Full) {
            Some(action) => action.recover().await,
            None => Ok(()),
        };

        let mut state = self.lock();
        match result {
            Ok(()) => {
                let full_recoveries = state.full_recoveries;
                let last_recovery = state.last_recovery;
                *state = EscalatorState {
                    full_recoveries,
                    last_recovery,
                    ..Default::default()
                };
                info!("Full recovery succeeded, metrics reset");
                RecoveryOutcome::Recovered
            }
            Err(e) => {
                state.category(RecoveryCategory::Full).phase = CategoryPhase::Exhausted;
                state.reload_scheduled = true;
                drop(state);

                error!(error = %e, "Full recovery failed, scheduling environment reload");
                let environment = self.environment.clone();
                let delay = self.config.reload_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    environment.reload();
                });
                RecoveryOutcome::ReloadScheduled
            }
        }
    }

    /// Successful recoveries over attempts; 1.0 before any attempt
    pub fn recovery_rate(&self) -> f64 {
        self.lock().recovery_rate()
    }

    pub fn is_reload_scheduled(&self) -> bool {
        self.lock().reload_scheduled
    }

    pub fn phase(&self, category: RecoveryCategory) -> CategoryPhase {
        self.lock()
            .categories
            .get(&category)
            .map(|stats| stats.phase)
            .unwrap_or(CategoryPhase::Idle)
    }

    pub fn stats(&self) -> RecoveryStats {
        let state = self.lock();
        RecoveryStats {
            total_errors: state.total_errors,
            recovery_attempts: state.recovery_attempts,
            successful_recoveries: state.successful_recoveries,
            full_recoveries: state.full_recoveries,
            reload_scheduled: state.reload_scheduled,
            recovery_rate: state.recovery_rate(),
            categories: state
                .categories
                .iter()
                .map(|(category, stats)| (category.to_string(), *stats))
                .collect(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}

impl HealthSource for ErrorRecoveryEscalator {
    fn name(&self) -> &str {
        "recovery"
    }

    fn health(&self) -> SubsystemHealth {
        let state = self.lock();
        let rate = state.recovery_rate();

        if state.reload_scheduled {
            return SubsystemHealth::new(self.name(), HealthStatus::Failed, "reload scheduled");
        }

        let exhausted = state
            .categories
            .values()
            .any(|stats| stats.phase == CategoryPhase::Exhausted);
        let detail = format!("recovery rate {:.2}", rate);

        if exhausted || rate < 0.5 {
            SubsystemHealth::new(self.name(), HealthStatus::Degraded, detail)
        } else {
            SubsystemHealth::new(self.name(), HealthStatus::Healthy, detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts runs and fails while `failing` is set
    #[derive(Default)]
    struct ScriptedAction {
        runs: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    impl ScriptedAction {
        fn failing() -> Arc<Self> {
            let action = Self::default();
            action.failing.store(true, Ordering::SeqCst);
            Arc::new(action)
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecoveryAction for ScriptedAction {
        async fn recover(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                Err(WardenError::Backend("still broken".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn escalator(config: RecoveryConfig) -> (ErrorRecoveryEscalator, Arc<AtomicUsize>) {
        let reloads = Arc::new(AtomicUsize::new(0));
        let host = {
            let reloads = reloads.clone();
            move || {
                reloads.fetch_add(1, Ordering::SeqCst);
            }
        };
        (ErrorRecoveryEscalator::new(config, Arc::new(host)), reloads)
    }

    #[tokio::test(start_paused = true)]
    async fn test_noise_floor_and_debounce() {
        let (escalator, _) = escalator(RecoveryConfig::default());

        for _ in 0..4 {
            assert_eq!(
                escalator.trigger_recovery(RecoveryCategory::Storage).await,
                RecoveryOutcome::Skipped(SkipReason::BelowNoiseFloor)
            );
        }
        assert_eq!(
            escalator.trigger_recovery(RecoveryCategory::Storage).await,
            RecoveryOutcome::Recovered
        );

        for _ in 0..5 {
            escalator.trigger_recovery(RecoveryCategory::Asset).await;
        }
        assert_eq!(
            escalator.trigger_recovery(RecoveryCategory::Asset).await,
            RecoveryOutcome::Skipped(SkipReason::Debounced)
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            escalator.trigger_recovery(RecoveryCategory::Asset).await,
            RecoveryOutcome::Recovered
        );
        assert_eq!(escalator.stats().total_errors, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_escalates_once() {
        let (escalator, reloads) = escalator(RecoveryConfig::default());
        let storage = ScriptedAction::failing();
        let full = Arc::new(ScriptedAction::default());
        escalator.register_action(RecoveryCategory::Storage, storage.clone());
        escalator.register_action(RecoveryCategory::Full, full.clone());

        assert_eq!(
            escalator.manual_recovery(RecoveryCategory::Storage).await,
            RecoveryOutcome::Retrying { remaining: 2 }
        );
        assert_eq!(
            escalator.manual_recovery(RecoveryCategory::Storage).await,
            RecoveryOutcome::Retrying { remaining: 1 }
        );
        assert_eq!(
            escalator.manual_recovery(RecoveryCategory::Storage).await,
            RecoveryOutcome::Escalated
        );

        assert_eq!(storage.runs(), 3);
        assert_eq!(full.runs(), 1);
        assert_eq!(escalator.phase(RecoveryCategory::Storage), CategoryPhase::Idle);
        assert_eq!(escalator.stats().full_recoveries, 1);
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_full_recovery_schedules_single_reload() {
        let config = RecoveryConfig {
            policy_retries: 1,
            ..Default::default()
        };
        let (escalator, reloads) = escalator(config);
        escalator.register_action(RecoveryCategory::Policy, ScriptedAction::failing());
        escalator.register_action(RecoveryCategory::Full, ScriptedAction::failing());

        assert_eq!(
            escalator.manual_recovery(RecoveryCategory::Policy).await,
            RecoveryOutcome::ReloadScheduled
        );
        assert_eq!(escalator.health().status, HealthStatus::Failed);
        assert_eq!(
            escalator.manual_recovery(RecoveryCategory::Full).await,
            RecoveryOutcome::ReloadScheduled
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_progress_guard() {
        let (escalator, _) = escalator(RecoveryConfig::default());
        let slow = Arc::new(ScriptedAction {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        escalator.register_action(RecoveryCategory::ResourcePool, slow.clone());

        let first = {
            let escalator = escalator.clone();
            tokio::spawn(async move {
                escalator
                    .manual_recovery(RecoveryCategory::ResourcePool)
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            escalator.manual_recovery(RecoveryCategory::ResourcePool).await,
            RecoveryOutcome::Skipped(SkipReason::InProgress)
        );
        assert_eq!(first.await.unwrap(), RecoveryOutcome::Recovered);
        assert_eq!(slow.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_exhaustion_runs_full_once() {
        let config = RecoveryConfig {
            storage_retries: 1,
            asset_retries: 1,
            ..Default::default()
        };
        let (escalator, _) = escalator(config);
        let full = Arc::new(ScriptedAction {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        escalator.register_action(RecoveryCategory::Storage, ScriptedAction::failing());
        escalator.register_action(RecoveryCategory::Asset, ScriptedAction::failing());
        escalator.register_action(RecoveryCategory::Full, full.clone());

        let (storage, asset) = tokio::join!(
            escalator.manual_recovery(RecoveryCategory::Storage),
            escalator.manual_recovery(RecoveryCategory::Asset),
        );

        assert_eq!(storage, RecoveryOutcome::Escalated);
        assert_eq!(asset, RecoveryOutcome::Escalated);
        assert_eq!(full.runs(), 1);
    }

    #[tokio::test]
    async fn test_recovery_rate_and_health() {
        let (escalator, _) = escalator(RecoveryConfig::default());
        assert_eq!(escalator.recovery_rate(), 1.0);

        escalator.register_action(RecoveryCategory::Storage, ScriptedAction::failing());
        escalator.manual_recovery(RecoveryCategory::Storage).await;
        assert_eq!(escalator.recovery_rate(), 0.0);
        assert_eq!(escalator.health().status, HealthStatus::Degraded);

        escalator.manual_recovery(RecoveryCategory::Asset).await;
        assert_eq!(escalator.recovery_rate(), 0.5);
        assert_eq!(escalator.health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(RecoveryCategory::ResourcePool.to_string(), "resource-pool");
        assert_eq!(
            serde_json::to_string(&RecoveryCategory::ResourcePool).unwrap(),
            "\"resource-pool\""
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(RecoveryConfig::default().validate().is_ok());
        let config = RecoveryConfig {
            asset_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
