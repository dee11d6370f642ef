//! Admission controller for scarce rendering contexts
//!
//! Hardware-accelerated rendering contexts are a hard-capped resource: the
//! host refuses new ones (or silently drops old ones) past a small limit.
//! Every component that needs a surface leases one here first, tagged with
//! the stable id of the element that owns it.
//!
//! Requests are granted immediately while capacity remains. At capacity a
//! `Critical` request evicts the lowest-priority lease; anything else waits
//! in a bounded queue ordered by priority then arrival, and gives up after
//! `queue_timeout`. A periodic sweep reclaims leases whose owner vanished
//! and hands the freed capacity to the queue.

use crate::error::DenyReason;
use crate::health_monitor::{HealthSource, HealthStatus, SubsystemHealth};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lease priority, ordered `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Core count at or below which a device is `Constrained`
pub const CONSTRAINED_MAX_CORES: usize = 2;

/// Installed memory (GiB) at or below which a device is `Constrained`
pub const CONSTRAINED_MAX_MEMORY_GIB: u64 = 4;

/// Coarse device capability class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Phones, tablets, very small machines
    Constrained,
    MidRange,
    Desktop,
}

impl DeviceClass {
    /// Classify from core count, memory and the handheld heuristic
    pub fn from_capabilities(logical_cores: usize, memory_gib: u64, is_mobile: bool) -> Self {
        if is_mobile
            || logical_cores <= CONSTRAINED_MAX_CORES
            || memory_gib <= CONSTRAINED_MAX_MEMORY_GIB
        {
            DeviceClass::Constrained
        } else if logical_cores >= 8 && memory_gib >= 8 {
            DeviceClass::Desktop
        } else {
            DeviceClass::MidRange
        }
    }
}

/// Configuration for admission controller behavior
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Leases that may be active at once
    pub max_concurrent_leases: usize,
    /// Requests that may wait for capacity
    pub max_queue_size: usize,
    /// How long a queued request waits before it is denied
    pub queue_timeout: Duration,
    /// Interval between orphan sweeps (guidance for the caller)
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::for_class(DeviceClass::MidRange)
    }
}

impl AdmissionConfig {
    /// Limits for a device class
    ///
    /// # Example
    ///
    /// ```
    /// use warden_core_resilience::admission::{AdmissionConfig, DeviceClass};
    ///
    /// let config = AdmissionConfig::for_class(DeviceClass::Constrained);
    /// assert_eq!(config.max_concurrent_leases, 2);
    /// assert_eq!(config.max_queue_size, 4);
    /// ```
    pub fn for_class(class: DeviceClass) -> Self {
        let (max_concurrent_leases, max_queue_size) = match class {
            DeviceClass::Constrained => (2, 4),
            DeviceClass::MidRange => (4, 8),
            DeviceClass::Desktop => (8, 16),
        };

        Self {
            max_concurrent_leases,
            max_queue_size,
            queue_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(2),
        }
    }

    /// Limits for raw device capabilities
    pub fn for_device(logical_cores: usize, memory_gib: u64, is_mobile: bool) -> Self {
        Self::for_class(DeviceClass::from_capabilities(
            logical_cores,
            memory_gib,
            is_mobile,
        ))
    }
}

/// An active lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub priority: Priority,
    pub granted_at: Instant,
    /// Stable id of the element that owns the surface
    pub owner: String,
}

/// Outcome of a lease request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// New lease granted from free capacity
    Granted,
    /// An existing lease for the same id was refreshed
    Renewed,
    /// Granted by evicting a lower-priority lease
    GrantedAfterEviction { evicted: String },
    /// No lease; the feature is unavailable right now
    Denied(DenyReason),
}

impl LeaseOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LeaseOutcome::Denied(_))
    }
}

/// Why a lease was taken away from its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    PreemptedByCritical,
    MemoryPressure,
    Orphaned,
    Reinitialized,
}

/// Broadcast to holders whose lease was revoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub id: String,
    pub reason: EvictionReason,
}

/// Memory pressure signal from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    Critical,
}

/// Tells the sweep whether a lease owner still exists
pub trait OwnerLiveness: Send + Sync {
    fn is_alive(&self, owner: &str) -> bool;
}

impl<F> OwnerLiveness for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_alive(&self, owner: &str) -> bool {
        self(owner)
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub orphans_reclaimed: Vec<String>,
    pub expired_requests: usize,
    pub granted_from_queue: usize,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    id: String,
    owner: String,
    priority: Priority,
    enqueued_at: Instant,
    resolver: oneshot::Sender<LeaseOutcome>,
}

#[derive(Debug)]
struct AdmissionState {
    leases: HashMap<String, Lease>,
    queue: VecDeque<Waiter>,
    max_concurrent: usize,
    emergency: bool,
    next_ticket: u64,
    granted: u64,
    denied: u64,
    evictions: u64,
    timeouts: u64,
}

impl AdmissionState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            leases: HashMap::new(),
            queue: VecDeque::new(),
            max_concurrent,
            emergency: false,
            next_ticket: 0,
            granted: 0,
            denied: 0,
            evictions: 0,
            timeouts: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.leases.len() < self.max_concurrent
    }

    fn grant(&mut self, id: &str, owner: &str, priority: Priority, now: Instant) {
        self.leases.insert(
            id.to_string(),
            Lease {
                id: id.to_string(),
                priority,
                granted_at: now,
                owner: owner.to_string(),
            },
        );
        self.granted += 1;
    }

    /// Lowest-priority non-critical lease, oldest first on ties
    fn eviction_victim(&self) -> Option<String> {
        self.leases
            .values()
            .filter(|lease| lease.priority < Priority::Critical)
            .min_by_key(|lease| (lease.priority, lease.granted_at))
            .map(|lease| lease.id.clone())
    }

    /// Insert behind every waiter of equal or higher priority
    fn enqueue(&mut self, waiter: Waiter) {
        let position = self
            .queue
            .iter()
            .position(|queued| queued.priority < waiter.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, waiter);
    }

    fn drain(&mut self, now: Instant) -> usize {
        let mut granted = 0;

        while self.has_capacity() {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.resolver.is_closed() {
                continue;
            }

            let outcome = if let Some(lease) = self.leases.get_mut(&waiter.id) {
                lease.granted_at = now;
                LeaseOutcome::Renewed
            } else {
                self.grant(&waiter.id, &waiter.owner, waiter.priority, now);
                LeaseOutcome::Granted
            };

            if waiter.resolver.send(outcome.clone()).is_err() {
                // Requester went away between the check and the send
                if outcome == LeaseOutcome::Granted {
                    self.leases.remove(&waiter.id);
                }
                continue;
            }

            debug!("Lease {} granted from queue", waiter.id);
            granted += 1;
        }

        granted
    }

    fn expire_waiters(&mut self, now: Instant, timeout: Duration) -> usize {
        let (expired, kept): (Vec<Waiter>, Vec<Waiter>) = self
            .queue
            .drain(..)
            .partition(|waiter| now.duration_since(waiter.enqueued_at) >= timeout);
        self.queue = kept.into();

        let count = expired.len();
        for waiter in expired {
            let _ = waiter
                .resolver
                .send(LeaseOutcome::Denied(DenyReason::Timeout));
        }
        self.timeouts += count as u64;
        count
    }
}

/// Controller statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub emergency: bool,
    pub granted: u64,
    pub denied: u64,
    pub evictions: u64,
    pub timeouts: u64,
}

impl AdmissionStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            0.0
        } else {
            (self.active as f64 / self.max_concurrent as f64) * 100.0
        }
    }
}

/// Bounded pool of rendering-context leases
///
/// # Example
/// ```
/// use warden_core_resilience::admission::{
///     AdmissionConfig, LeaseOutcome, Priority, ResourceAdmissionController,
/// };
///
/// # #[tokio::main]
/// # async fn main() {
/// let controller = ResourceAdmissionController::new(AdmissionConfig {
///     max_concurrent_leases: 1,
///     ..Default::default()
/// });
///
/// assert_eq!(controller.request_lease("chart", Priority::Medium).await, LeaseOutcome::Granted);
/// let outcome = controller.request_lease("editor", Priority::Critical).await;
/// assert_eq!(outcome, LeaseOutcome::GrantedAfterEviction { evicted: "chart".to_string() });
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ResourceAdmissionController {
    config: Arc<AdmissionConfig>,
    state: Arc<Mutex<AdmissionState>>,
    evictions: broadcast::Sender<Eviction>,
}

impl ResourceAdmissionController {
    /// Create a new controller
    pub fn new(config: AdmissionConfig) -> Self {
        let (evictions, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(AdmissionState::new(config.max_concurrent_leases))),
            config: Arc::new(config),
            evictions,
        }
    }

    /// Create a controller sized for a device class
    pub fn for_class(class: DeviceClass) -> Self {
        Self::new(AdmissionConfig::for_class(class))
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, id: String, reason: EvictionReason) {
        // No subscribers is fine
        let _ = self.evictions.send(Eviction { id, reason });
    }

    /// Request a lease for the element `id`
    pub async fn request_lease(&self, id: impl Into<String>, priority: Priority) -> LeaseOutcome {
        let id = id.into();
        let owner = id.clone();
        self.request_lease_owned(id, owner, priority).await
    }

    /// Request a lease whose owner differs from the lease id
    pub async fn request_lease_owned(
        &self,
        id: impl Into<String>,
        owner: impl Into<String>,
        priority: Priority,
    ) -> LeaseOutcome {
        let id = id.into();
        let owner = owner.into();

        let (ticket, mut rx) = {
            let now = Instant::now();
            let mut state = self.lock();

            if let Some(lease) = state.leases.get_mut(&id) {
                lease.granted_at = now;
                return LeaseOutcome::Renewed;
            }

            if state.has_capacity() {
                state.grant(&id, &owner, priority, now);
                return LeaseOutcome::Granted;
            }

            if priority == Priority::Critical {
                if let Some(victim) = state.eviction_victim() {
                    state.leases.remove(&victim);
                    state.evictions += 1;
                    state.grant(&id, &owner, priority, now);
                    drop(state);

                    info!("Lease {} evicted for critical request {}", victim, id);
                    self.announce(victim.clone(), EvictionReason::PreemptedByCritical);
                    return LeaseOutcome::GrantedAfterEviction { evicted: victim };
                }
            }

            if state.queue.len() >= self.config.max_queue_size {
                state.denied += 1;
                debug!("Lease {} denied: queue full", id);
                return LeaseOutcome::Denied(DenyReason::QueueFull);
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.enqueue(Waiter {
                ticket,
                id: id.clone(),
                owner,
                priority,
                enqueued_at: now,
                resolver: tx,
            });
            debug!("Lease {} queued ({} waiting)", id, state.queue.len());
            (ticket, rx)
        };

        match tokio::time::timeout(self.config.queue_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => LeaseOutcome::Denied(DenyReason::Cancelled),
            Err(_) => {
                let mut state = self.lock();
                if let Some(position) = state.queue.iter().position(|w| w.ticket == ticket) {
                    state.queue.remove(position);
                    state.timeouts += 1;
                    debug!("Lease {} timed out in queue", id);
                    return LeaseOutcome::Denied(DenyReason::Timeout);
                }
                drop(state);

                // Resolved while the timer fired
                rx.try_recv()
                    .unwrap_or(LeaseOutcome::Denied(DenyReason::Timeout))
            }
        }
    }

    /// Release a lease and hand its capacity to the queue
    pub fn release(&self, id: &str) -> bool {
        let mut state = self.lock();
        let released = state.leases.remove(id).is_some();
        if released {
            state.drain(Instant::now());
        }
        released
    }

    /// Withdraw a queued request
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        match state.queue.iter().position(|w| w.id == id) {
            Some(position) => {
                if let Some(waiter) = state.queue.remove(position) {
                    let _ = waiter
                        .resolver
                        .send(LeaseOutcome::Denied(DenyReason::Cancelled));
                }
                true
            }
            None => false,
        }
    }

    /// Reclaim orphaned leases, expire stale waiters and drain the queue
    pub fn sweep(&self, liveness: &dyn OwnerLiveness) -> SweepReport {
        let now = Instant::now();
        let mut state = self.lock();

        let orphans: Vec<String> = state
            .leases
            .values()
            .filter(|lease| !liveness.is_alive(&lease.owner))
            .map(|lease| lease.id.clone())
            .collect();
        for id in &orphans {
            state.leases.remove(id);
        }

        let expired_requests = state.expire_waiters(now, self.config.queue_timeout);
        let granted_from_queue = state.drain(now);
        drop(state);

        if !orphans.is_empty() {
            info!("Reclaimed {} orphaned leases", orphans.len());
        }
        for id in &orphans {
            self.announce(id.clone(), EvictionReason::Orphaned);
        }

        SweepReport {
            orphans_reclaimed: orphans,
            expired_requests,
            granted_from_queue,
        }
    }

    /// React to a memory pressure signal
    ///
    /// `Critical` shrinks capacity to one lease and evicts every non-critical
    /// lease. `Normal` restores capacity. Returns the evicted ids.
    pub fn report_memory_pressure(&self, pressure: MemoryPressure) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.lock();

        match pressure {
            MemoryPressure::Critical if !state.emergency => {
                state.emergency = true;
                state.max_concurrent = 1;

                let evicted: Vec<String> = state
                    .leases
                    .values()
                    .filter(|lease| lease.priority < Priority::Critical)
                    .map(|lease| lease.id.clone())
                    .collect();
                for id in &evicted {
                    state.leases.remove(id);
                }
                state.evictions += evicted.len() as u64;
                drop(state);

                warn!(
                    "Memory pressure: admission emergency mode, {} leases evicted",
                    evicted.len()
                );
                for id in &evicted {
                    self.announce(id.clone(), EvictionReason::MemoryPressure);
                }
                evicted
            }
            MemoryPressure::Normal if state.emergency => {
                state.emergency = false;
                state.max_concurrent = self.config.max_concurrent_leases;
                let granted = state.drain(now);
                info!(
                    "Memory pressure subsided, capacity restored ({} queued granted)",
                    granted
                );
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Drop every lease and waiter and restore configured capacity
    pub fn reinitialize(&self) {
        let mut state = self.lock();
        let waiters: Vec<Waiter> = state.queue.drain(..).collect();
        let leases: Vec<String> = state.leases.drain().map(|(id, _)| id).collect();
        *state = AdmissionState::new(self.config.max_concurrent_leases);
        drop(state);

        for waiter in waiters {
            let _ = waiter
                .resolver
                .send(LeaseOutcome::Denied(DenyReason::Cancelled));
        }
        for id in leases {
            self.announce(id, EvictionReason::Reinitialized);
        }
        info!("Admission controller reinitialized");
    }

    /// Subscribe to lease revocations
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.evictions.subscribe()
    }

    /// Whether `id` currently holds a lease
    pub fn is_leased(&self, id: &str) -> bool {
        self.lock().leases.contains_key(id)
    }

    /// Snapshot of active leases
    pub fn active_leases(&self) -> Vec<Lease> {
        self.lock().leases.values().cloned().collect()
    }

    /// Get current controller statistics
    pub fn stats(&self) -> AdmissionStats {
        let state = self.lock();
        AdmissionStats {
            active: state.leases.len(),
            queued: state.queue.len(),
            max_concurrent: state.max_concurrent,
            max_queue: self.config.max_queue_size,
            emergency: state.emergency,
            granted: state.granted,
            denied: state.denied,
            evictions: state.evictions,
            timeouts: state.timeouts,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

impl HealthSource for ResourceAdmissionController {
    fn name(&self) -> &str {
        "resource_pool"
    }

    fn health(&self) -> SubsystemHealth {
        let stats = self.stats();
        let detail = format!(
            "{}/{} leases, {} queued",
            stats.active, stats.max_concurrent, stats.queued
        );

        let status = if stats.max_queue > 0 && stats.queued >= stats.max_queue {
            HealthStatus::Failed
        } else if stats.emergency || (stats.active >= stats.max_concurrent && stats.queued > 0) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SubsystemHealth::new(self.name(), status, detail)
    }
}
