//! Warden Core Resilience: Pure-logic resource governance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks Warden uses to protect a host
//! application from local resource exhaustion:
//!
//! - **Signal Governor**: Sliding-window rate limiting with rest periods and emergency lock
//! - **Activation Breaker**: Cooldown plus circuit breaker for disruptive actions
//! - **Admission Controller**: Bounded lease pool with priority queueing and eviction
//! - **Health Monitor**: Classification of subsystem reports into an overall status
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage backends
//! - Rendering surfaces or the UI tree
//! - Application-specific concerns
//!
//! Host collaborators reach it only through small traits such as
//! [`admission::OwnerLiveness`] and [`health_monitor::HealthSource`].
//!
//! # Architecture
//!
//! ```text
//!          incoming signals              surface requests
//!                 │                            │
//!                 ▼                            ▼
//! ┌───────────────────────────┐  ┌───────────────────────────┐
//! │     Signal Governor       │  │   Admission Controller    │
//! │ (window, rest, emergency) │  │ (leases, queue, eviction) │
//! └─────────────┬─────────────┘  └─────────────┬─────────────┘
//!               │                              │
//!               └──────────────┬───────────────┘
//!                              ▼
//!               ┌───────────────────────────┐
//!               │      Health Monitor       │  ← polled by the orchestrator
//!               │ (healthy → emergency)     │
//!               └───────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```
//! use warden_core_resilience::prelude::*;
//!
//! let governor = SignalGovernor::new_default();
//! let doubled = governor.process_signal(21, |n| n * 2);
//! assert_eq!(doubled, Ok(42));
//! ```

pub mod admission;
pub mod circuit_breaker;
pub mod error;
pub mod health_monitor;
pub mod rate_limiter;

// Re-export main types for convenience
pub use admission::{
    AdmissionConfig, AdmissionStats, DeviceClass, Eviction, EvictionReason, Lease, LeaseOutcome,
    MemoryPressure, OwnerLiveness, Priority, ResourceAdmissionController, SweepReport,
    CONSTRAINED_MAX_CORES, CONSTRAINED_MAX_MEMORY_GIB,
};
pub use circuit_breaker::{
    ActivationBreaker, ActivationBreakerConfig, ActivationDecision, CircuitState,
};
pub use error::{DenyReason, ResilienceError};
pub use health_monitor::{
    HealthMonitor, HealthSnapshot, HealthSource, HealthStatus, OverallHealth, SubsystemHealth,
};
pub use rate_limiter::{Admission, GovernorConfig, GovernorStats, RateState, SignalGovernor};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use warden_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::admission::{
        AdmissionConfig, LeaseOutcome, Priority, ResourceAdmissionController,
    };
    pub use super::circuit_breaker::{ActivationBreaker, ActivationBreakerConfig};
    pub use super::error::{DenyReason, ResilienceError};
    pub use super::health_monitor::{HealthSource, HealthStatus, OverallHealth, SubsystemHealth};
    pub use super::rate_limiter::{Admission, GovernorConfig, SignalGovernor};
}
