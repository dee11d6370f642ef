/*!
 * Warden - client-side resource governance and self-healing
 *
 * Protects a host application from exhausting local resources:
 * - Signal governor with rest periods and an emergency lock
 * - Persistent store that falls back to memory when storage is blocked
 * - Bounded rendering-context pool with priority admission
 * - Content-policy violation handling with fallbacks and hook stubs
 * - Unused preload tracking
 * - Tiered error recovery escalating to a full reset and reload
 * - Health orchestration across every subsystem
 * - Singleton lifecycle with a breaker on emergency activation
 */

pub mod assets;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod probe;
pub mod recovery;
pub mod store;

// Re-export commonly used types
pub use config::{LogLevel, LoggingConfig, WardenConfig};
pub use context::{ErrorEvent, ResilienceContext, ResilienceContextBuilder};
pub use error::{Result, WardenError};
pub use lifecycle::{EmergencyActivation, InstanceLifecycleManager, ManagedInstance};
pub use orchestrator::{OptimizedConfig, StabilityOrchestrator};
pub use probe::{DeviceProbe, DeviceProfile};
pub use recovery::{ErrorRecoveryEscalator, RecoveryCategory, RecoveryOutcome};
pub use store::{KeyValueBackend, PersistentStoreAdapter};
pub use warden_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
