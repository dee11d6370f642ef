/*!
 * Error types for Warden
 */

use std::io;
use thiserror::Error;
use warden_core_resilience::ResilienceError;

use crate::recovery::RecoveryCategory;

pub type Result<T> = std::result::Result<T, WardenError>;

#[derive(Debug, Error)]
pub enum WardenError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or parsing of a stored envelope failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A storage backend refused an operation
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A resource could not be loaded
    #[error("Resource load failed for {url}: {reason}")]
    Load { url: String, reason: String },

    /// Instance construction failed
    #[error("Instance construction failed: {0}")]
    Construction(String),

    /// Recovery action failed
    #[error("Recovery failed for {category}: {reason}")]
    Recovery {
        category: RecoveryCategory,
        reason: String,
    },

    /// Error from the resilience primitives
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl WardenError {
    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        match self {
            WardenError::Config(_) => true,
            WardenError::Serialization(_) => true,
            WardenError::Resilience(e) => !e.is_absorbed(),

            WardenError::Io(_) => false,
            WardenError::Backend(_) => false,
            WardenError::Load { .. } => false,
            WardenError::Construction(_) => false,
            WardenError::Recovery { .. } => false,
        }
    }

    /// Recovery category an error of this kind should be routed to
    pub fn recovery_category(&self) -> Option<RecoveryCategory> {
        match self {
            WardenError::Io(_) | WardenError::Backend(_) | WardenError::Serialization(_) => {
                Some(RecoveryCategory::Storage)
            }
            WardenError::Load { .. } => Some(RecoveryCategory::Asset),
            WardenError::Resilience(e) => match e {
                ResilienceError::StoreBlocked => Some(RecoveryCategory::Storage),
                ResilienceError::PolicyViolation { .. } => Some(RecoveryCategory::Policy),
                ResilienceError::LeaseDenied(_) => Some(RecoveryCategory::ResourcePool),
                ResilienceError::RecoveryExhausted { .. } => Some(RecoveryCategory::Full),
                _ => None,
            },
            WardenError::Recovery { category, .. } => Some(*category),
            WardenError::Config(_) | WardenError::Construction(_) => None,
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(err: toml::de::Error) -> Self {
        WardenError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core_resilience::DenyReason;

    #[test]
    fn test_error_display() {
        let err = WardenError::Config("poll interval must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: poll interval must be > 0"
        );

        let err = WardenError::Load {
            url: "https://cdn.example/widget.js".to_string(),
            reason: "blocked".to_string(),
        };
        assert!(err.to_string().contains("widget.js"));
    }

    #[test]
    fn test_recovery_routing() {
        let io = WardenError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(io.recovery_category(), Some(RecoveryCategory::Storage));

        let lease = WardenError::from(ResilienceError::LeaseDenied(DenyReason::Timeout));
        assert_eq!(lease.recovery_category(), Some(RecoveryCategory::ResourcePool));

        let policy = WardenError::from(ResilienceError::PolicyViolation {
            url: "https://x".to_string(),
        });
        assert_eq!(policy.recovery_category(), Some(RecoveryCategory::Policy));

        assert_eq!(WardenError::Config("x".into()).recovery_category(), None);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(WardenError::Config("bad".into()).is_fatal());
        assert!(!WardenError::Backend("quota".into()).is_fatal());

        let full = WardenError::from(ResilienceError::RecoveryExhausted {
            category: "full".to_string(),
        });
        assert!(full.is_fatal());
    }
}
