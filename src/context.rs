/*!
 * Resilience context
 *
 * Owns one instance of every subsystem and the wiring between them: health
 * sources registered with the orchestrator, recovery actions registered with
 * the escalator, and the maintenance tasks that keep the periodic sweeps
 * running. Host collaborators are injected through the builder.
 */

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_core_resilience::{
    DenyReason, HealthSource, HealthStatus, LeaseOutcome, MemoryPressure, OwnerLiveness,
    Priority, ResilienceError, ResourceAdmissionController, SignalGovernor,
};

use crate::assets::{AssetHost, ResourceUsageTracker};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::lifecycle::ManagedInstance;
use crate::orchestrator::StabilityOrchestrator;
use crate::policy::{
    HookRegistry, InMemoryHooks, PolicyViolationMonitor, ResourceDescriptor, ResourceLoader,
    ViolationEvent, ViolationOutcome,
};
use crate::probe::{DeviceProbe, DeviceProfile};
use crate::recovery::{
    EnvironmentHost, ErrorRecoveryEscalator, RecoveryAction, RecoveryCategory, RecoveryOutcome,
};
use crate::store::{CanaryResult, FileBackend, KeyValueBackend, MemoryBackend, PersistentStoreAdapter};

/// An error observed by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
    /// Explicit routing; when absent the message is classified
    pub category: Option<RecoveryCategory>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: RecoveryCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Route by explicit category, then by well-known message fragments
    pub fn classify(&self) -> Option<RecoveryCategory> {
        if self.category.is_some() {
            return self.category;
        }

        const STORAGE: &[&str] = &[
            "blocked access to storage",
            "quotaexceeded",
            "quota exceeded",
            "tracking prevention",
            "storage",
        ];
        const POLICY: &[&str] = &[
            "content security policy",
            "refused to load",
            "violates the following",
            "script-src",
        ];
        const POOL: &[&str] = &[
            "webgl",
            "context lost",
            "too many active",
            "rendering context",
        ];
        const ASSET: &[&str] = &[
            "preloaded using link preload but not used",
            "failed to load resource",
            "chunkloaderror",
            "loading chunk",
        ];

        let message = self.message.to_ascii_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

        if matches(POLICY) {
            Some(RecoveryCategory::Policy)
        } else if matches(POOL) {
            Some(RecoveryCategory::ResourcePool)
        } else if matches(ASSET) {
            Some(RecoveryCategory::Asset)
        } else if matches(STORAGE) {
            Some(RecoveryCategory::Storage)
        } else {
            None
        }
    }
}

struct StoreRecovery {
    store: PersistentStoreAdapter,
}

#[async_trait]
impl RecoveryAction for StoreRecovery {
    async fn recover(&self) -> Result<()> {
        self.store.sweep_expired().await;
        match self.store.probe_canary().await {
            CanaryResult::Available { .. } => Ok(()),
            CanaryResult::Unavailable => Err(ResilienceError::StoreBlocked.into()),
        }
    }
}

struct PolicyRecovery {
    policy: PolicyViolationMonitor,
}

#[async_trait]
impl RecoveryAction for PolicyRecovery {
    async fn recover(&self) -> Result<()> {
        // Unblock so resources get another chance; violations re-block them
        let cleared = self.policy.clear_violations();
        debug!(cleared, "Policy violations cleared");
        Ok(())
    }
}

struct PoolRecovery {
    admission: ResourceAdmissionController,
    liveness: Arc<dyn OwnerLiveness>,
}

#[async_trait]
impl RecoveryAction for PoolRecovery {
    async fn recover(&self) -> Result<()> {
        let report = self.admission.sweep(self.liveness.as_ref());
        debug!(
            orphans = report.orphans_reclaimed.len(),
            granted = report.granted_from_queue,
            "Resource pool swept"
        );
        if self.admission.health().status == HealthStatus::Failed {
            return Err(ResilienceError::LeaseDenied(DenyReason::QueueFull).into());
        }
        Ok(())
    }
}

struct AssetRecovery {
    assets: ResourceUsageTracker,
}

#[async_trait]
impl RecoveryAction for AssetRecovery {
    async fn recover(&self) -> Result<()> {
        let removed = self.assets.sweep_unused();
        let evicted = self.assets.sweep_cache();
        debug!(removed = removed.len(), evicted, "Asset caches swept");
        Ok(())
    }
}

struct FullRecovery {
    governor: SignalGovernor,
    store: PersistentStoreAdapter,
    admission: ResourceAdmissionController,
    policy: PolicyViolationMonitor,
    assets: ResourceUsageTracker,
}

#[async_trait]
impl RecoveryAction for FullRecovery {
    async fn recover(&self) -> Result<()> {
        self.assets.clear();
        let canary = self.store.reset().await;
        self.admission.reinitialize();
        self.policy.clear_violations();
        self.governor.reset();

        let failed: Vec<String> = [
            self.store.health(),
            self.admission.health(),
            self.policy.health(),
            self.assets.health(),
            self.governor.health(),
        ]
        .into_iter()
        .filter(|report| report.status == HealthStatus::Failed)
        .map(|report| report.name)
        .collect();

        info!(?canary, still_failed = failed.len(), "Full recovery steps completed");
        if failed.len() >= 2 {
            return Err(WardenError::Recovery {
                category: RecoveryCategory::Full,
                reason: format!("still failing: {}", failed.join(", ")),
            });
        }
        Ok(())
    }
}

struct Maintenance {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Every subsystem, wired together
pub struct ResilienceContext {
    config: WardenConfig,
    profile: DeviceProfile,
    governor: SignalGovernor,
    store: PersistentStoreAdapter,
    admission: ResourceAdmissionController,
    policy: PolicyViolationMonitor,
    assets: ResourceUsageTracker,
    escalator: ErrorRecoveryEscalator,
    orchestrator: StabilityOrchestrator,
    liveness: Arc<dyn OwnerLiveness>,
    emergency: AtomicBool,
    maintenance: Mutex<Option<Maintenance>>,
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("profile", &self.profile)
            .field("emergency", &self.emergency_active())
            .field("maintenance", &self.maintenance_running())
            .finish()
    }
}

/// Builder for [`ResilienceContext`]
///
/// Every collaborator has a default suitable for embedding and tests: an
/// in-process (or file, if `store.data_dir` is set) backend, a loader that
/// refuses everything, an in-memory hook registry and no-op hosts.
pub struct ResilienceContextBuilder {
    config: WardenConfig,
    profile: Option<DeviceProfile>,
    backend: Option<Arc<dyn KeyValueBackend>>,
    loader: Option<Arc<dyn ResourceLoader>>,
    hooks: Option<Arc<dyn HookRegistry>>,
    asset_host: Option<Arc<dyn AssetHost>>,
    environment: Option<Arc<dyn EnvironmentHost>>,
    liveness: Option<Arc<dyn OwnerLiveness>>,
}

impl ResilienceContextBuilder {
    pub fn profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn asset_host(mut self, host: Arc<dyn AssetHost>) -> Self {
        self.asset_host = Some(host);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentHost>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn liveness(mut self, liveness: Arc<dyn OwnerLiveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn build(self) -> Result<ResilienceContext> {
        let config = self.config;
        config.validate()?;

        let profile = self.profile.unwrap_or_else(DeviceProbe::scan);
        let backend: Arc<dyn KeyValueBackend> = match (self.backend, &config.store.data_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => Arc::new(FileBackend::new(dir)),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let loader = self.loader.unwrap_or_else(|| {
            Arc::new(|resource: &ResourceDescriptor| -> Result<()> {
                Err(WardenError::Load {
                    url: resource.url.clone(),
                    reason: "no resource loader configured".to_string(),
                })
            })
        });
        let hooks = self
            .hooks
            .unwrap_or_else(|| Arc::new(InMemoryHooks::new()));
        let asset_host = self
            .asset_host
            .unwrap_or_else(|| Arc::new(|_: &str| {}));
        let environment = self.environment.unwrap_or_else(|| {
            Arc::new(|| warn!("Environment reload requested but no host is attached"))
        });
        let liveness = self
            .liveness
            .unwrap_or_else(|| Arc::new(|_: &str| true));

        let governor = SignalGovernor::new(config.governor.to_governor_config());
        let store = PersistentStoreAdapter::new(config.store.clone(), backend);
        let admission =
            ResourceAdmissionController::new(config.admission.to_admission_config(profile.class));
        let policy = PolicyViolationMonitor::new(config.policy.clone(), loader, hooks);
        let assets = ResourceUsageTracker::new(config.assets.clone(), asset_host);
        let escalator = ErrorRecoveryEscalator::new(config.recovery.clone(), environment);
        let orchestrator =
            StabilityOrchestrator::new(config.orchestrator.clone(), Some(escalator.clone()));

        escalator.register_action(
            RecoveryCategory::Storage,
            Arc::new(StoreRecovery {
                store: store.clone(),
            }),
        );
        escalator.register_action(
            RecoveryCategory::Policy,
            Arc::new(PolicyRecovery {
                policy: policy.clone(),
            }),
        );
        escalator.register_action(
            RecoveryCategory::ResourcePool,
            Arc::new(PoolRecovery {
                admission: admission.clone(),
                liveness: liveness.clone(),
            }),
        );
        escalator.register_action(
            RecoveryCategory::Asset,
            Arc::new(AssetRecovery {
                assets: assets.clone(),
            }),
        );
        escalator.register_action(
            RecoveryCategory::Full,
            Arc::new(FullRecovery {
                governor: governor.clone(),
                store: store.clone(),
                admission: admission.clone(),
                policy: policy.clone(),
                assets: assets.clone(),
            }),
        );

        orchestrator.register(Arc::new(governor.clone()));
        orchestrator.register(Arc::new(store.clone()));
        orchestrator.register(Arc::new(admission.clone()));
        orchestrator.register(Arc::new(policy.clone()));
        orchestrator.register(Arc::new(assets.clone()));
        orchestrator.register(Arc::new(escalator.clone()));

        info!(
            class = ?profile.class,
            leases = admission.config().max_concurrent_leases,
            "Resilience context built"
        );

        Ok(ResilienceContext {
            config,
            profile,
            governor,
            store,
            admission,
            policy,
            assets,
            escalator,
            orchestrator,
            liveness,
            emergency: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        })
    }
}

impl ResilienceContext {
    pub fn builder(config: WardenConfig) -> ResilienceContextBuilder {
        ResilienceContextBuilder {
            config,
            profile: None,
            backend: None,
            loader: None,
            hooks: None,
            asset_host: None,
            environment: None,
            liveness: None,
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn governor(&self) -> &SignalGovernor {
        &self.governor
    }

    pub fn store(&self) -> &PersistentStoreAdapter {
        &self.store
    }

    pub fn admission(&self) -> &ResourceAdmissionController {
        &self.admission
    }

    pub fn policy(&self) -> &PolicyViolationMonitor {
        &self.policy
    }

    pub fn assets(&self) -> &ResourceUsageTracker {
        &self.assets
    }

    pub fn escalator(&self) -> &ErrorRecoveryEscalator {
        &self.escalator
    }

    pub fn orchestrator(&self) -> &StabilityOrchestrator {
        &self.orchestrator
    }

    /// Handle a policy violation and count it towards policy recovery
    pub async fn on_violation(&self, event: ViolationEvent) -> ViolationOutcome {
        let outcome = self.policy.report_violation(event).await;
        let recovery = self
            .escalator
            .trigger_recovery(RecoveryCategory::Policy)
            .await;
        debug!(?outcome, ?recovery, "Violation handled");
        outcome
    }

    /// Route a host error to its recovery category; None if unclassified
    pub async fn on_error(&self, event: ErrorEvent) -> Option<RecoveryOutcome> {
        let Some(category) = event.classify() else {
            debug!(message = %event.message, "Unclassified error ignored");
            return None;
        };
        Some(self.escalator.trigger_recovery(category).await)
    }

    /// Lease a rendering context; denials count as resource-pool errors
    pub async fn request_surface(
        &self,
        id: impl Into<String>,
        owner: impl Into<String>,
        priority: Priority,
    ) -> LeaseOutcome {
        let outcome = self.admission.request_lease_owned(id, owner, priority).await;
        if let LeaseOutcome::Denied(reason) = &outcome {
            debug!(%reason, "Surface lease denied");
            self.escalator
                .trigger_recovery(RecoveryCategory::ResourcePool)
                .await;
        }
        outcome
    }

    /// Leave emergency mode and restore full capacity
    pub fn exit_emergency(&self) {
        if self.emergency.swap(false, Ordering::SeqCst) {
            self.admission.report_memory_pressure(MemoryPressure::Normal);
            info!("Emergency mode lifted");
        }
    }

    pub fn maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the periodic tasks; returns false if they are already running
    pub fn start_maintenance(&self) -> bool {
        let mut maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if maintenance.is_some() {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let store = self.store.clone();
        tasks.push(spawn_periodic(
            "store_canary",
            self.config.store.canary_interval(),
            shutdown_rx.clone(),
            move || {
                let store = store.clone();
                async move {
                    store.sweep_expired().await;
                    store.probe_canary().await;
                }
            },
        ));

        let admission = self.admission.clone();
        let liveness = self.liveness.clone();
        tasks.push(spawn_periodic(
            "admission_sweep",
            self.admission.config().sweep_interval,
            shutdown_rx.clone(),
            move || {
                let report = admission.sweep(liveness.as_ref());
                if !report.orphans_reclaimed.is_empty() || report.expired_requests > 0 {
                    debug!(?report, "Admission sweep");
                }
                std::future::ready(())
            },
        ));

        let assets = self.assets.clone();
        tasks.push(spawn_periodic(
            "asset_unused_sweep",
            self.config.assets.grace_window(),
            shutdown_rx.clone(),
            move || {
                assets.sweep_unused();
                std::future::ready(())
            },
        ));

        let assets = self.assets.clone();
        tasks.push(spawn_periodic(
            "asset_cache_sweep",
            self.config.assets.cache_sweep_interval(),
            shutdown_rx.clone(),
            move || {
                assets.sweep_cache();
                std::future::ready(())
            },
        ));

        let orchestrator = self.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.run(shutdown_rx).await;
        }));

        info!(tasks = tasks.len(), "Maintenance started");
        *maintenance = Some(Maintenance { shutdown, tasks });
        true
    }

    /// Stop maintenance and wait for the tasks to finish
    pub async fn stop_maintenance(&self) {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(maintenance) = maintenance {
            let _ = maintenance.shutdown.send(true);
            for task in maintenance.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Maintenance task ended abnormally");
                }
            }
            info!("Maintenance stopped");
        }
    }
}

/// Run `tick` every `period` until shutdown; the first run is after one period
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // interval_at panics on a zero period
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(task = name, "Maintenance task stopped");
                        return;
                    }
                }
            }
        }
    })
}

#[async_trait]
impl ManagedInstance for ResilienceContext {
    type Config = WardenConfig;

    async fn construct(config: WardenConfig) -> Result<Self> {
        let context = ResilienceContext::builder(config).build()?;
        context.start_maintenance();
        Ok(context)
    }

    async fn shutdown(&self) {
        self.stop_maintenance().await;
    }

    /// Force a governor rest and shrink the surface pool to one lease
    fn enter_emergency(&self) {
        self.emergency.store(true, Ordering::SeqCst);
        self.governor.activate_emergency();
        let evicted = self
            .admission
            .report_memory_pressure(MemoryPressure::Critical);
        warn!(evicted = evicted.len(), "Emergency mode entered");
    }

    fn emergency_active(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }
}
