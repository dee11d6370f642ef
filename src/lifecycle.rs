//! Singleton lifecycle management
//!
//! Guarantees at most one live instance of a managed component. Concurrent
//! callers of [`InstanceLifecycleManager::get_instance`] join the same
//! in-flight construction instead of racing to build duplicates, and a
//! generation counter makes sure a construction that outlives
//! [`InstanceLifecycleManager::destroy_all_instances`] is discarded.
//!
//! Emergency activations on the live instance go through an
//! [`ActivationBreaker`] so a misbehaving caller cannot flip emergency mode in
//! a tight loop.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_core_resilience::{
    ActivationBreaker, ActivationBreakerConfig, ActivationDecision, HealthSource, HealthStatus,
    SubsystemHealth,
};

use crate::context::ResilienceContext;
use crate::error::{Result, WardenError};

/// A component whose lifetime is governed by the manager
#[async_trait]
pub trait ManagedInstance: Send + Sync + 'static {
    type Config: Clone + Send + Sync + 'static;

    async fn construct(config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// Stop background work; must be safe to call more than once
    async fn shutdown(&self);

    /// Switch into emergency mode
    fn enter_emergency(&self);

    fn emergency_active(&self) -> bool;
}

/// Lifecycle manager tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Delay before construction starts, letting re-entrant callers coalesce
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_max_emergency_activations")]
    pub max_emergency_activations: u32,

    #[serde(default = "default_observation_window_secs")]
    pub observation_window_secs: u64,

    #[serde(default = "default_activation_cooldown_ms")]
    pub activation_cooldown_ms: u64,

    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            max_emergency_activations: default_max_emergency_activations(),
            observation_window_secs: default_observation_window_secs(),
            activation_cooldown_ms: default_activation_cooldown_ms(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn breaker_config(&self) -> ActivationBreakerConfig {
        ActivationBreakerConfig {
            max_activations: self.max_emergency_activations,
            observation_window: Duration::from_secs(self.observation_window_secs),
            activation_cooldown: Duration::from_millis(self.activation_cooldown_ms),
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

fn default_settle_delay_ms() -> u64 {
    50
}

fn default_max_emergency_activations() -> u32 {
    3
}

fn default_observation_window_secs() -> u64 {
    60
}

fn default_activation_cooldown_ms() -> u64 {
    5_000
}

fn default_breaker_cooldown_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyActivation {
    Activated,
    /// Too soon after the previous activation; nothing changed
    CoolingDown,
    /// Too many activations recently; rejected until the breaker closes
    BreakerOpen,
    NoInstance,
}

type Construction<T> = Shared<BoxFuture<'static, std::result::Result<Arc<T>, String>>>;

struct Slot<T: ManagedInstance> {
    instance: Option<Arc<T>>,
    in_flight: Option<(u64, Construction<T>)>,
    generation: u64,
    constructions: u64,
}

/// Owns the single live instance of `T`
pub struct InstanceLifecycleManager<T: ManagedInstance> {
    config: LifecycleConfig,
    breaker: ActivationBreaker,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: ManagedInstance> Clone for InstanceLifecycleManager<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            breaker: self.breaker.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T: ManagedInstance> std::fmt::Debug for InstanceLifecycleManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.lock();
        f.debug_struct("InstanceLifecycleManager")
            .field("config", &self.config)
            .field("live", &slot.instance.is_some())
            .field("in_flight", &slot.in_flight.is_some())
            .field("generation", &slot.generation)
            .finish()
    }
}

impl<T: ManagedInstance> InstanceLifecycleManager<T> {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            breaker: ActivationBreaker::new(config.breaker_config()),
            config,
            slot: Arc::new(Mutex::new(Slot {
                instance: None,
                in_flight: None,
                generation: 0,
                constructions: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live instance, constructing it if needed
    ///
    /// Callers arriving while a construction is in flight wait for that
    /// construction. A failed construction is not cached; the next call
    /// tries again.
    pub async fn get_instance(&self, config: T::Config) -> Result<Arc<T>> {
        let (generation, construction) = {
            let mut slot = self.lock();
            if let Some(instance) = &slot.instance {
                return Ok(instance.clone());
            }

            match slot.in_flight.clone() {
                Some((generation, construction)) => {
                    debug!(generation, "Joining in-flight construction");
                    (generation, construction)
                }
                None => {
                    let settle = self.config.settle_delay();
                    let construction = async move {
                        tokio::time::sleep(settle).await;
                        T::construct(config)
                            .await
                            .map(Arc::new)
                            .map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();

                    let generation = slot.generation;
                    slot.constructions += 1;
                    slot.in_flight = Some((generation, construction.clone()));
                    (generation, construction)
                }
            }
        };

        let result = construction.await;

        let stale = {
            let mut slot = self.lock();
            if slot
                .in_flight
                .as_ref()
                .is_some_and(|(in_flight, _)| *in_flight == generation)
            {
                slot.in_flight = None;
            }

            if slot.generation == generation {
                return match result {
                    Ok(instance) => {
                        if slot.instance.is_none() {
                            info!(generation, "Instance constructed");
                        }
                        Ok(slot.instance.get_or_insert(instance).clone())
                    }
                    Err(reason) => {
                        warn!(generation, %reason, "Instance construction failed");
                        Err(WardenError::Construction(reason))
                    }
                };
            }
            result
        };

        if let Ok(orphan) = stale {
            warn!(generation, "Discarding instance constructed after destroy");
            orphan.shutdown().await;
        }
        Err(WardenError::Construction(
            "instances were destroyed during construction".to_string(),
        ))
    }

    /// The live instance, if any, without constructing
    pub fn current(&self) -> Option<Arc<T>> {
        self.lock().instance.clone()
    }

    /// Put the live instance into emergency mode, subject to the breaker
    pub fn activate_emergency(&self) -> EmergencyActivation {
        let Some(instance) = self.current() else {
            return EmergencyActivation::NoInstance;
        };

        match self.breaker.try_activate() {
            ActivationDecision::Allowed { count } => {
                info!(count, "Emergency mode activated");
                instance.enter_emergency();
                EmergencyActivation::Activated
            }
            ActivationDecision::CoolingDown { remaining } => {
                debug!(?remaining, "Emergency activation cooling down");
                EmergencyActivation::CoolingDown
            }
            ActivationDecision::Open { remaining } => {
                warn!(?remaining, "Emergency activation rejected, breaker open");
                EmergencyActivation::BreakerOpen
            }
        }
    }

    /// Shut down the live instance and abandon in-flight constructions
    pub async fn destroy_all_instances(&self) {
        let instance = {
            let mut slot = self.lock();
            slot.generation += 1;
            slot.in_flight = None;
            slot.instance.take()
        };

        if let Some(instance) = instance {
            instance.shutdown().await;
            info!("Instance destroyed");
        }
    }

    /// Constructions started since creation
    pub fn construction_count(&self) -> u64 {
        self.lock().constructions
    }

    pub fn breaker(&self) -> &ActivationBreaker {
        &self.breaker
    }
}

impl<T: ManagedInstance> HealthSource for InstanceLifecycleManager<T> {
    fn name(&self) -> &str {
        "lifecycle"
    }

    fn health(&self) -> SubsystemHealth {
        if self.breaker.is_open() {
            return SubsystemHealth::new(self.name(), HealthStatus::Failed, "emergency breaker open");
        }

        match self.current() {
            Some(instance) if instance.emergency_active() => {
                SubsystemHealth::new(self.name(), HealthStatus::Degraded, "emergency mode")
            }
            Some(_) => SubsystemHealth::new(self.name(), HealthStatus::Healthy, "live"),
            None => SubsystemHealth::new(self.name(), HealthStatus::Healthy, "no instance"),
        }
    }
}

static GLOBAL: Lazy<InstanceLifecycleManager<ResilienceContext>> =
    Lazy::new(|| InstanceLifecycleManager::new(LifecycleConfig::default()));

/// Process-wide manager for the resilience context
///
/// This is the only global in the crate. Libraries embedding Warden should
/// prefer an explicitly constructed manager; the CLI uses this one.
pub fn global() -> &'static InstanceLifecycleManager<ResilienceContext> {
    &GLOBAL
}
