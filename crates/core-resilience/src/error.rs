//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Why a lease request did not produce a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The wait queue was already at `max_queue_size`
    QueueFull,
    /// The request waited longer than `queue_timeout`
    Timeout,
    /// The request was withdrawn or the controller was reinitialized
    Cancelled,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::QueueFull => write!(f, "queue full"),
            DenyReason::Timeout => write!(f, "queue timeout"),
            DenyReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors that can occur in resilience operations
///
/// Most of these are absorbed locally and reported as typed outcomes; only
/// `RecoveryExhausted` on the full category is ever fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Admission denied by the signal governor
    #[error("Rate exceeded: {0}")]
    RateExceeded(String),

    /// Persistent storage is unavailable, memory fallback in use
    #[error("Persistent store blocked")]
    StoreBlocked,

    /// A resource was blocked by the security policy
    #[error("Resource blocked by policy: {url}")]
    PolicyViolation { url: String },

    /// The resource pool could not provide a lease
    #[error("Lease denied: {0}")]
    LeaseDenied(DenyReason),

    /// A recovery category ran out of retries
    #[error("Recovery exhausted for category {category}")]
    RecoveryExhausted { category: String },

    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Timeout occurred
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::RateExceeded(_)
                | ResilienceError::Timeout(_)
                | ResilienceError::LeaseDenied(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_) | ResilienceError::CircuitOpen
        )
    }

    /// Errors the layer absorbs without involving the user
    pub fn is_absorbed(&self) -> bool {
        !matches!(self, ResilienceError::RecoveryExhausted { category } if category == "full")
    }
}
