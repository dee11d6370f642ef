//! Activation circuit breaker
//!
//! Guards an expensive, disruptive action (such as an emergency mode switch)
//! against being fired in a loop. It has two layers:
//! - a cooldown between consecutive activations
//! - a breaker that opens once more than `max_activations` happen inside the
//!   observation window
//!
//! States:
//! - Closed: activations pass through, subject to the cooldown
//! - Open: every activation is rejected until `next_probe`; the breaker then
//!   closes on its own and forgets past activations

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Activations pass through
    Closed,
    /// Activations are rejected until `next_probe`
    Open { next_probe: Instant },
}

/// Configuration for activation breaker behavior
#[derive(Debug, Clone)]
pub struct ActivationBreakerConfig {
    /// Activations allowed inside the observation window
    pub max_activations: u32,
    /// Window over which activations are counted
    pub observation_window: Duration,
    /// Minimum spacing between two accepted activations
    pub activation_cooldown: Duration,
    /// How long the breaker stays open
    pub breaker_cooldown: Duration,
}

impl Default for ActivationBreakerConfig {
    fn default() -> Self {
        Self {
            max_activations: 3,
            observation_window: Duration::from_secs(60),
            activation_cooldown: Duration::from_secs(5),
            breaker_cooldown: Duration::from_secs(300),
        }
    }
}

/// Outcome of an activation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationDecision {
    /// Activation accepted; `count` activations in the current window
    Allowed { count: u32 },
    /// Too soon after the previous activation
    CoolingDown { remaining: Duration },
    /// The breaker is open
    Open { remaining: Duration },
}

impl ActivationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ActivationDecision::Allowed { .. })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    activations: VecDeque<Instant>,
    last_activation: Option<Instant>,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            activations: VecDeque::new(),
            last_activation: None,
            times_opened: 0,
        }
    }

    /// Close an open breaker whose cooldown has elapsed
    fn refresh(&mut self, now: Instant) {
        if let CircuitState::Open { next_probe } = self.state {
            if now >= next_probe {
                info!("Activation breaker closed after cooldown");
                self.state = CircuitState::Closed;
                self.activations.clear();
                self.last_activation = None;
            }
        }
    }
}

/// Circuit breaker counting activations of a guarded action
///
/// # Example
/// ```
/// use warden_core_resilience::circuit_breaker::{ActivationBreaker, ActivationBreakerConfig};
/// use std::time::Duration;
///
/// let breaker = ActivationBreaker::new(ActivationBreakerConfig {
///     max_activations: 1,
///     activation_cooldown: Duration::ZERO,
///     ..Default::default()
/// });
///
/// assert!(breaker.try_activate().is_allowed());
/// assert!(!breaker.try_activate().is_allowed());
/// assert!(breaker.is_open());
/// ```
#[derive(Debug, Clone)]
pub struct ActivationBreaker {
    config: Arc<ActivationBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

impl ActivationBreaker {
    /// Create a new breaker with the given configuration
    pub fn new(config: ActivationBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
        }
    }

    /// Create a new breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(ActivationBreakerConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an activation attempt
    pub fn try_activate(&self) -> ActivationDecision {
        let now = Instant::now();
        let mut state = self.lock();
        state.refresh(now);

        if let CircuitState::Open { next_probe } = state.state {
            return ActivationDecision::Open {
                remaining: next_probe - now,
            };
        }

        if let Some(last) = state.last_activation {
            let since = now.duration_since(last);
            if since < self.config.activation_cooldown {
                return ActivationDecision::CoolingDown {
                    remaining: self.config.activation_cooldown - since,
                };
            }
        }

        while let Some(&oldest) = state.activations.front() {
            if now.duration_since(oldest) >= self.config.observation_window {
                state.activations.pop_front();
            } else {
                break;
            }
        }

        if state.activations.len() as u32 >= self.config.max_activations {
            let next_probe = now + self.config.breaker_cooldown;
            state.state = CircuitState::Open { next_probe };
            state.times_opened += 1;
            warn!(
                "Activation breaker opened after {} activations in {:?}, blocking for {:?}",
                state.activations.len(),
                self.config.observation_window,
                self.config.breaker_cooldown
            );
            return ActivationDecision::Open {
                remaining: self.config.breaker_cooldown,
            };
        }

        state.activations.push_back(now);
        state.last_activation = Some(now);

        ActivationDecision::Allowed {
            count: state.activations.len() as u32,
        }
    }

    /// Get the current state of the breaker
    pub fn get_state(&self) -> CircuitState {
        let mut state = self.lock();
        state.refresh(Instant::now());
        state.state
    }

    /// Whether activations are currently blocked by the breaker
    pub fn is_open(&self) -> bool {
        matches!(self.get_state(), CircuitState::Open { .. })
    }

    /// Activations counted in the current window
    pub fn activation_count(&self) -> u32 {
        let mut state = self.lock();
        state.refresh(Instant::now());
        state.activations.len() as u32
    }

    /// How many times the breaker has opened
    pub fn times_opened(&self) -> u64 {
        self.lock().times_opened
    }

    /// Reset the breaker to closed state
    pub fn reset(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.activations.clear();
        state.last_activation = None;
    }
}
