//! Signal governor: sliding-window rate limiting with rest periods
//!
//! Every signal passes through [`SignalGovernor::try_admit`] before any side
//! effect happens. The governor keeps a log of grants inside the current
//! window. The call that overflows the window is denied and starts a rest
//! period, so a flood is cut off instead of being smoothed out.
//!
//! On top of that sits an emergency escalation: each
//! [`SignalGovernor::activate_emergency`] forces a longer rest, and once the
//! number of activations reaches the configured threshold the governor stays
//! locked until an explicit [`SignalGovernor::reset`].
//!
//! All timing uses `tokio::time::Instant`, so tests can pause and advance the
//! clock.

use crate::error::ResilienceError;
use crate::health_monitor::{HealthSource, HealthStatus, SubsystemHealth};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as DiagnosticLimiter,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the signal governor
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Maximum signals granted inside any window
    pub max_signals_per_window: u32,
    /// Length of the sliding window
    pub window: Duration,
    /// Rest imposed on the call that overflows the window
    pub resting_period: Duration,
    /// Rest imposed by an emergency activation
    pub recovery_time: Duration,
    /// Activations after which admission stays locked until `reset()`
    pub emergency_threshold: u32,
    /// Minimum spacing between denial diagnostics
    pub notification_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_signals_per_window: 10,
            window: Duration::from_secs(1),
            resting_period: Duration::from_secs(1),
            recovery_time: Duration::from_secs(5),
            emergency_threshold: 3,
            notification_interval: Duration::from_secs(5),
        }
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The signal may proceed
    Granted,
    /// The governor is resting; retry after `remaining`
    Resting { remaining: Duration },
    /// Emergency escalation reached its threshold; only `reset()` lifts it
    EmergencyLocked,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Snapshot of the governor's rate state
#[derive(Debug, Clone, Copy)]
pub struct RateState {
    /// Grants currently inside the sliding window
    pub signals_in_window: u32,
    /// Start of the current window (oldest grant still counted)
    pub window_start: Instant,
    /// End of the current rest period, if any
    pub resting_until: Option<Instant>,
    /// An emergency rest is in force
    pub emergency_active: bool,
    /// Emergency activations since the last reset
    pub emergency_activation_count: u32,
}

/// Governor counters
#[derive(Debug, Clone, Copy)]
pub struct GovernorStats {
    pub granted: u64,
    pub denied: u64,
    pub state: RateState,
}

#[derive(Debug)]
struct GovernorState {
    grants: VecDeque<Instant>,
    resting_until: Option<Instant>,
    emergency_active: bool,
    emergency_activation_count: u32,
    granted: u64,
    denied: u64,
}

impl GovernorState {
    fn new() -> Self {
        Self {
            grants: VecDeque::new(),
            resting_until: None,
            emergency_active: false,
            emergency_activation_count: 0,
            granted: 0,
            denied: 0,
        }
    }

    fn is_locked(&self, config: &GovernorConfig) -> bool {
        self.emergency_active && self.emergency_activation_count >= config.emergency_threshold
    }

    fn evaluate(&mut self, now: Instant, config: &GovernorConfig) -> Admission {
        if self.is_locked(config) {
            return Admission::EmergencyLocked;
        }

        if let Some(until) = self.resting_until {
            if now < until {
                return Admission::Resting {
                    remaining: until - now,
                };
            }
            // Rest expiry starts a fresh window
            self.resting_until = None;
            self.grants.clear();
            if self.emergency_active {
                debug!("Emergency rest elapsed, resuming admission");
                self.emergency_active = false;
            }
        }

        while let Some(&oldest) = self.grants.front() {
            if now.duration_since(oldest) >= config.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }

        if self.grants.len() as u32 >= config.max_signals_per_window {
            // Overflowing call: deny and rest
            self.resting_until = Some(now + config.resting_period);
            return Admission::Resting {
                remaining: config.resting_period,
            };
        }

        self.grants.push_back(now);
        Admission::Granted
    }

    fn snapshot(&self, now: Instant) -> RateState {
        RateState {
            signals_in_window: self.grants.len() as u32,
            window_start: self.grants.front().copied().unwrap_or(now),
            resting_until: self.resting_until,
            emergency_active: self.emergency_active,
            emergency_activation_count: self.emergency_activation_count,
        }
    }
}

/// Rate limiter plus emergency breaker for incoming signals
///
/// # Example
/// ```
/// use warden_core_resilience::rate_limiter::{GovernorConfig, SignalGovernor};
/// use std::time::Duration;
///
/// let governor = SignalGovernor::new(GovernorConfig {
///     max_signals_per_window: 1,
///     resting_period: Duration::from_secs(1),
///     ..Default::default()
/// });
///
/// assert!(governor.admit());
/// assert!(!governor.admit());
/// ```
#[derive(Clone)]
pub struct SignalGovernor {
    config: Arc<GovernorConfig>,
    state: Arc<Mutex<GovernorState>>,
    diagnostics: Option<Arc<DiagnosticLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl std::fmt::Debug for SignalGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SignalGovernor {
    /// Create a new governor with the given configuration
    pub fn new(config: GovernorConfig) -> Self {
        let diagnostics = Quota::with_period(config.notification_interval)
            .map(|quota| Arc::new(DiagnosticLimiter::direct(quota)));

        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(GovernorState::new())),
            diagnostics,
        }
    }

    /// Create a governor with default configuration
    pub fn new_default() -> Self {
        Self::new(GovernorConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt to admit one signal
    pub fn try_admit(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock();
        let admission = state.evaluate(now, &self.config);

        if admission.is_granted() {
            state.granted += 1;
        } else {
            state.denied += 1;
            let denied = state.denied;
            drop(state);
            self.notify_denied(admission, denied);
        }

        admission
    }

    /// Boolean view of [`try_admit`](Self::try_admit)
    pub fn admit(&self) -> bool {
        self.try_admit().is_granted()
    }

    /// Admit a signal and apply it
    ///
    /// `apply` only runs when the signal is granted. A denial is backpressure
    /// and comes back as `RateExceeded`.
    pub fn process_signal<P, R, F>(&self, payload: P, apply: F) -> Result<R, ResilienceError>
    where
        F: FnOnce(P) -> R,
    {
        match self.try_admit() {
            Admission::Granted => Ok(apply(payload)),
            Admission::Resting { remaining } => Err(ResilienceError::RateExceeded(format!(
                "resting for {:?}",
                remaining
            ))),
            Admission::EmergencyLocked => Err(ResilienceError::RateExceeded(
                "emergency lock active".to_string(),
            )),
        }
    }

    /// Force an extended rest and count the activation
    ///
    /// Returns the activation count after this call.
    pub fn activate_emergency(&self) -> u32 {
        let now = Instant::now();
        let mut state = self.lock();

        state.emergency_active = true;
        state.emergency_activation_count += 1;

        let until = now + self.config.recovery_time;
        state.resting_until = Some(match state.resting_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });

        let count = state.emergency_activation_count;
        if count >= self.config.emergency_threshold {
            warn!(
                "Signal governor locked after {} emergency activations, reset required",
                count
            );
        } else {
            info!(
                "Signal governor emergency rest for {:?} (activation {}/{})",
                self.config.recovery_time, count, self.config.emergency_threshold
            );
        }

        count
    }

    /// Clear all rate and emergency state
    pub fn reset(&self) {
        let mut state = self.lock();
        state.grants.clear();
        state.resting_until = None;
        state.emergency_active = false;
        state.emergency_activation_count = 0;
        info!("Signal governor reset");
    }

    /// Whether admission is locked until an explicit reset
    pub fn is_locked(&self) -> bool {
        self.lock().is_locked(&self.config)
    }

    /// Current counters and rate state
    pub fn stats(&self) -> GovernorStats {
        let state = self.lock();
        GovernorStats {
            granted: state.granted,
            denied: state.denied,
            state: state.snapshot(Instant::now()),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn notify_denied(&self, admission: Admission, denied_total: u64) {
        let allowed = match &self.diagnostics {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        };

        if allowed {
            warn!(
                "Signal denied ({:?}), {} denials so far",
                admission, denied_total
            );
        }
    }
}

impl HealthSource for SignalGovernor {
    fn name(&self) -> &str {
        "signal_governor"
    }

    fn health(&self) -> SubsystemHealth {
        let now = Instant::now();
        let state = self.lock();
        let resting = state.resting_until.is_some_and(|until| now < until);

        let (status, detail) = if state.is_locked(&self.config) {
            (
                HealthStatus::Failed,
                format!(
                    "locked after {} emergency activations",
                    state.emergency_activation_count
                ),
            )
        } else if state.emergency_active || resting {
            (HealthStatus::Degraded, "resting".to_string())
        } else {
            (
                HealthStatus::Healthy,
                format!("{} signals in window", state.grants.len()),
            )
        };

        SubsystemHealth::new(self.name(), status, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_governor() -> SignalGovernor {
        SignalGovernor::new(GovernorConfig {
            max_signals_per_window: 1,
            window: Duration::from_millis(1000),
            resting_period: Duration::from_millis(1000),
            recovery_time: Duration::from_millis(5000),
            emergency_threshold: 2,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_starts_rest_then_recovers() {
        let governor = tight_governor();

        let first = governor.admit();
        tokio::time::advance(Duration::from_millis(10)).await;
        let second = governor.admit();
        assert_eq!([first, second], [true, false]);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(governor.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_shorter_than_window_resets_window() {
        let governor = SignalGovernor::new(GovernorConfig {
            max_signals_per_window: 1,
            window: Duration::from_millis(1000),
            resting_period: Duration::from_millis(100),
            ..Default::default()
        });

        assert!(governor.admit());
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!governor.admit());

        // The first grant is still inside the window but the rest is over
        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(governor.try_admit(), Admission::Granted);
        assert_eq!(governor.stats().state.signals_in_window, 1);

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(matches!(governor.try_admit(), Admission::Resting { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_never_exceed_window_limit() {
        let governor = SignalGovernor::new(GovernorConfig {
            max_signals_per_window: 5,
            window: Duration::from_millis(100),
            resting_period: Duration::from_millis(100),
            ..Default::default()
        });

        let window = Duration::from_millis(100);
        let steps = [1u64, 3, 7, 2, 11, 5, 13, 1, 1, 17, 4, 9];
        let mut grants: Vec<Instant> = Vec::new();

        for i in 0..400 {
            if governor.admit() {
                grants.push(Instant::now());
            }
            let step = steps[i % steps.len()];
            tokio::time::advance(Duration::from_millis(step)).await;
        }

        assert!(!grants.is_empty());
        for (i, start) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < window)
                .count();
            assert!(in_window <= 5, "{} grants inside one window", in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_locks_at_threshold() {
        let governor = tight_governor();

        assert_eq!(governor.activate_emergency(), 1);
        assert!(!governor.admit());

        // Rest elapses below threshold: admission resumes
        tokio::time::advance(Duration::from_millis(5001)).await;
        assert!(governor.admit());
        assert!(!governor.stats().state.emergency_active);

        assert_eq!(governor.activate_emergency(), 2);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(governor.try_admit(), Admission::EmergencyLocked);
        assert!(governor.is_locked());

        governor.reset();
        assert!(governor.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_signal_applies_only_when_granted() {
        let governor = tight_governor();

        let applied = governor.process_signal(21, |n| n * 2);
        assert_eq!(applied, Ok(42));

        let denied = governor.process_signal(21, |n| n * 2);
        assert!(matches!(denied, Err(ResilienceError::RateExceeded(_))));

        let stats = governor.stats();
        assert_eq!(stats.granted, 1);
        assert_eq!(stats.denied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reflects_rest_and_lock() {
        let governor = tight_governor();
        assert_eq!(governor.health().status, HealthStatus::Healthy);

        governor.admit();
        governor.admit();
        assert_eq!(governor.health().status, HealthStatus::Degraded);

        governor.activate_emergency();
        governor.activate_emergency();
        assert_eq!(governor.health().status, HealthStatus::Failed);
    }
}
