/*!
 * Policy violation monitor
 *
 * Reacts to resources refused by the host's security policy. Each violation
 * is recorded in a bounded ring buffer and the offending URL is remembered as
 * blocked, so later loads short-circuit. If a fallback is registered for the
 * URL it is tried once; otherwise (or if that fails) the well-known global
 * hooks the blocked resource would have defined are stubbed out so callers do
 * not crash on a missing global.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use warden_core_resilience::{HealthSource, HealthStatus, SubsystemHealth};

use crate::error::Result;

/// Kind of resource, inferred from the policy directive that refused it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Script,
    Stylesheet,
    Font,
    Image,
    Connect,
    Other,
}

impl ResourceKind {
    pub fn from_directive(directive: &str) -> Self {
        let directive = directive.trim().to_ascii_lowercase();
        if directive.starts_with("script-src") {
            ResourceKind::Script
        } else if directive.starts_with("style-src") {
            ResourceKind::Stylesheet
        } else if directive.starts_with("font-src") {
            ResourceKind::Font
        } else if directive.starts_with("img-src") {
            ResourceKind::Image
        } else if directive.starts_with("connect-src") {
            ResourceKind::Connect
        } else {
            ResourceKind::Other
        }
    }
}

/// A resource the host wants loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub url: String,
    pub kind: ResourceKind,
}

impl ResourceDescriptor {
    pub fn new(url: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// Violation report from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationEvent {
    pub blocked_url: String,
    pub directive: String,
}

impl ViolationEvent {
    pub fn new(blocked_url: impl Into<String>, directive: impl Into<String>) -> Self {
        Self {
            blocked_url: blocked_url.into(),
            directive: directive.into(),
        }
    }
}

/// Entry in the violation ring buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub resource_url: String,
    pub directive: String,
    pub timestamp: DateTime<Utc>,
}

/// What the monitor did about a violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// A registered fallback loaded in place of the blocked resource
    FallbackLoaded { fallback_url: String },
    /// No-op stubs were installed for these hooks
    Stubbed { hooks: Vec<String> },
    /// Recorded only; nothing else left to do
    Recorded,
}

/// Result of a guarded load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// Known to be refused by policy; not attempted
    Blocked,
    Failed { reason: String },
}

/// Loads resources on behalf of the monitor
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, resource: &ResourceDescriptor) -> Result<()>;
}

#[async_trait]
impl<F> ResourceLoader for F
where
    F: Fn(&ResourceDescriptor) -> Result<()> + Send + Sync,
{
    async fn load(&self, resource: &ResourceDescriptor) -> Result<()> {
        self(resource)
    }
}

/// Installs no-op global hooks
pub trait HookRegistry: Send + Sync {
    /// Install a stub; returns false if the hook already exists
    fn install_stub(&self, hook: &str) -> bool;
}

/// Hook registry that just remembers what was stubbed
#[derive(Debug, Default)]
pub struct InMemoryHooks {
    installed: Mutex<BTreeSet<String>>,
}

impl InMemoryHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl HookRegistry for InMemoryHooks {
    fn install_stub(&self, hook: &str) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hook.to_string())
    }
}

/// Policy monitor tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Ring buffer capacity
    #[serde(default = "default_max_violations")]
    pub max_violations: usize,

    /// Global hooks stubbed when a blocked resource has no working fallback
    #[serde(default = "default_well_known_hooks")]
    pub well_known_hooks: Vec<String>,

    /// Blocked URLs without fallback at which the subsystem reports failed
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: usize,

    /// Blocked URL → fallback URL
    #[serde(default)]
    pub fallbacks: BTreeMap<String, String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_violations: default_max_violations(),
            well_known_hooks: default_well_known_hooks(),
            failed_threshold: default_failed_threshold(),
            fallbacks: BTreeMap::new(),
        }
    }
}

fn default_max_violations() -> usize {
    100
}

fn default_well_known_hooks() -> Vec<String> {
    vec![
        "gtag".to_string(),
        "dataLayer".to_string(),
        "analytics".to_string(),
    ]
}

fn default_failed_threshold() -> usize {
    5
}

#[derive(Debug, Default)]
struct PolicyState {
    records: VecDeque<ViolationRecord>,
    blocked: BTreeSet<String>,
    fallbacks: HashMap<String, String>,
    stubbed: BTreeSet<String>,
    total_violations: u64,
}

/// Counters for the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    pub total_violations: u64,
    pub buffered: usize,
    pub blocked_urls: usize,
    pub blocked_without_fallback: usize,
    pub stubbed_hooks: usize,
}

/// Records policy violations and routes around blocked resources
#[derive(Clone)]
pub struct PolicyViolationMonitor {
    config: Arc<PolicyConfig>,
    loader: Arc<dyn ResourceLoader>,
    hooks: Arc<dyn HookRegistry>,
    state: Arc<Mutex<PolicyState>>,
}

impl std::fmt::Debug for PolicyViolationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyViolationMonitor")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PolicyViolationMonitor {
    pub fn new(
        config: PolicyConfig,
        loader: Arc<dyn ResourceLoader>,
        hooks: Arc<dyn HookRegistry>,
    ) -> Self {
        let state = PolicyState {
            fallbacks: config
                .fallbacks
                .iter()
                .map(|(url, fallback)| (url.clone(), fallback.clone()))
                .collect(),
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            loader,
            hooks,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fallback for an exact URL
    pub fn register_fallback(&self, url: impl Into<String>, fallback_url: impl Into<String>) {
        self.lock().fallbacks.insert(url.into(), fallback_url.into());
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        self.lock().blocked.contains(url)
    }

    /// Record a violation and react to it
    pub async fn report_violation(&self, event: ViolationEvent) -> ViolationOutcome {
        let fallback = {
            let mut state = self.lock();
            state.total_violations += 1;
            state.records.push_back(ViolationRecord {
                resource_url: event.blocked_url.clone(),
                directive: event.directive.clone(),
                timestamp: Utc::now(),
            });
            while state.records.len() > self.config.max_violations {
                state.records.pop_front();
            }
            state.blocked.insert(event.blocked_url.clone());

            state
                .fallbacks
                .get(&event.blocked_url)
                .filter(|fallback| !state.blocked.contains(fallback.as_str()))
                .cloned()
        };

        warn!(
            url = %event.blocked_url,
            directive = %event.directive,
            "Resource blocked by security policy"
        );

        if let Some(fallback_url) = fallback {
            let resource =
                ResourceDescriptor::new(&fallback_url, ResourceKind::from_directive(&event.directive));
            match self.loader.load(&resource).await {
                Ok(()) => {
                    info!(url = %event.blocked_url, fallback = %fallback_url, "Fallback loaded");
                    return ViolationOutcome::FallbackLoaded { fallback_url };
                }
                Err(e) => {
                    warn!(fallback = %fallback_url, error = %e, "Fallback load failed");
                }
            }
        }

        let hooks = self.stub_hooks();
        if hooks.is_empty() {
            ViolationOutcome::Recorded
        } else {
            info!(hooks = ?hooks, "Installed no-op stubs for blocked globals");
            ViolationOutcome::Stubbed { hooks }
        }
    }

    /// Install stubs not installed before; returns the newly installed ones
    fn stub_hooks(&self) -> Vec<String> {
        let pending: Vec<String> = {
            let state = self.lock();
            self.config
                .well_known_hooks
                .iter()
                .filter(|hook| !state.stubbed.contains(hook.as_str()))
                .cloned()
                .collect()
        };

        let mut installed = Vec::new();
        for hook in pending {
            if self.hooks.install_stub(&hook) {
                installed.push(hook.clone());
            }
            self.lock().stubbed.insert(hook);
        }
        installed
    }

    /// Load a resource unless it is already known to be blocked
    pub async fn load_resource(&self, resource: &ResourceDescriptor) -> LoadOutcome {
        if self.is_blocked(&resource.url) {
            debug!(url = %resource.url, "Skipping load of blocked resource");
            return LoadOutcome::Blocked;
        }

        match self.loader.load(resource).await {
            Ok(()) => LoadOutcome::Loaded,
            Err(e) => LoadOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Buffered violations, oldest first
    pub fn violations(&self) -> Vec<ViolationRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Drop buffered violations and unblock every URL
    pub fn clear_violations(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.records.len();
        state.records.clear();
        state.blocked.clear();
        cleared
    }

    pub fn stats(&self) -> PolicyStats {
        let state = self.lock();
        PolicyStats {
            total_violations: state.total_violations,
            buffered: state.records.len(),
            blocked_urls: state.blocked.len(),
            blocked_without_fallback: state
                .blocked
                .iter()
                .filter(|url| !state.fallbacks.contains_key(url.as_str()))
                .count(),
            stubbed_hooks: state.stubbed.len(),
        }
    }
}

impl HealthSource for PolicyViolationMonitor {
    fn name(&self) -> &str {
        "policy_monitor"
    }

    fn health(&self) -> SubsystemHealth {
        let stats = self.stats();
        let detail = format!(
            "{} blocked, {} without fallback",
            stats.blocked_urls, stats.blocked_without_fallback
        );

        let status = if stats.blocked_without_fallback >= self.config.failed_threshold {
            HealthStatus::Failed
        } else if stats.blocked_urls > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SubsystemHealth::new(self.name(), status, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TRACKER: &str = "https://tracker.example/analytics.js";
    const MIRROR: &str = "https://static.example/analytics.js";

    fn monitor_with(
        config: PolicyConfig,
        loader: impl ResourceLoader + 'static,
    ) -> (PolicyViolationMonitor, Arc<InMemoryHooks>) {
        let hooks = Arc::new(InMemoryHooks::new());
        let monitor = PolicyViolationMonitor::new(config, Arc::new(loader), hooks.clone());
        (monitor, hooks)
    }

    fn accept_all(_: &ResourceDescriptor) -> Result<()> {
        Ok(())
    }

    fn reject_all(resource: &ResourceDescriptor) -> Result<()> {
        Err(WardenError::Load {
            url: resource.url.clone(),
            reason: "refused".to_string(),
        })
    }

    #[tokio::test]
    async fn test_fallback_loaded() {
        let (monitor, hooks) = monitor_with(PolicyConfig::default(), accept_all);
        monitor.register_fallback(TRACKER, MIRROR);

        let outcome = monitor
            .report_violation(ViolationEvent::new(TRACKER, "script-src-elem"))
            .await;

        assert_eq!(
            outcome,
            ViolationOutcome::FallbackLoaded {
                fallback_url: MIRROR.to_string()
            }
        );
        assert!(monitor.is_blocked(TRACKER));
        assert!(hooks.installed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fallback_stubs_hooks_once() {
        let (monitor, hooks) = monitor_with(PolicyConfig::default(), reject_all);
        monitor.register_fallback(TRACKER, MIRROR);

        let outcome = monitor
            .report_violation(ViolationEvent::new(TRACKER, "script-src"))
            .await;
        assert_eq!(
            outcome,
            ViolationOutcome::Stubbed {
                hooks: vec![
                    "gtag".to_string(),
                    "dataLayer".to_string(),
                    "analytics".to_string()
                ]
            }
        );
        assert_eq!(hooks.installed().len(), 3);

        let again = monitor
            .report_violation(ViolationEvent::new("https://other.example/x.js", "script-src"))
            .await;
        assert_eq!(again, ViolationOutcome::Recorded);
    }

    #[tokio::test]
    async fn test_fallback_uses_directive_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            move |resource: &ResourceDescriptor| -> Result<()> {
                seen.lock().unwrap().push(resource.kind);
                Ok(())
            }
        };
        let (monitor, _) = monitor_with(PolicyConfig::default(), recorder);
        monitor.register_fallback("https://fonts.example/a.woff2", "/fonts/a.woff2");

        monitor
            .report_violation(ViolationEvent::new("https://fonts.example/a.woff2", "font-src"))
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![ResourceKind::Font]);
    }

    #[tokio::test]
    async fn test_load_resource_short_circuits_blocked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = {
            let calls = calls.clone();
            move |_: &ResourceDescriptor| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        let config = PolicyConfig {
            well_known_hooks: Vec::new(),
            ..Default::default()
        };
        let (monitor, _) = monitor_with(config, counting);

        let resource = ResourceDescriptor::new(TRACKER, ResourceKind::Script);
        assert_eq!(monitor.load_resource(&resource).await, LoadOutcome::Loaded);

        assert_eq!(
            monitor
                .report_violation(ViolationEvent::new(TRACKER, "script-src"))
                .await,
            ViolationOutcome::Recorded
        );
        assert_eq!(monitor.load_resource(&resource).await, LoadOutcome::Blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_failure_is_an_outcome() {
        let (monitor, _) = monitor_with(PolicyConfig::default(), reject_all);
        let outcome = monitor
            .load_resource(&ResourceDescriptor::new(MIRROR, ResourceKind::Script))
            .await;
        assert!(matches!(outcome, LoadOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_ring_buffer_bounded() {
        let config = PolicyConfig {
            max_violations: 3,
            ..Default::default()
        };
        let (monitor, _) = monitor_with(config, accept_all);

        for i in 0..5 {
            monitor
                .report_violation(ViolationEvent::new(format!("https://x.example/{i}"), "img-src"))
                .await;
        }

        let records = monitor.violations();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].resource_url, "https://x.example/2");
        assert_eq!(monitor.stats().total_violations, 5);

        assert_eq!(monitor.clear_violations(), 3);
        assert!(!monitor.is_blocked("https://x.example/4"));
    }

    #[tokio::test]
    async fn test_health_thresholds() {
        let config = PolicyConfig {
            failed_threshold: 2,
            ..Default::default()
        };
        let (monitor, _) = monitor_with(config, accept_all);
        assert_eq!(monitor.health().status, HealthStatus::Healthy);

        monitor.register_fallback("https://a.example", "https://b.example");
        monitor
            .report_violation(ViolationEvent::new("https://a.example", "script-src"))
            .await;
        assert_eq!(monitor.health().status, HealthStatus::Degraded);

        monitor
            .report_violation(ViolationEvent::new("https://c.example", "script-src"))
            .await;
        assert_eq!(monitor.health().status, HealthStatus::Degraded);

        monitor
            .report_violation(ViolationEvent::new("https://d.example", "script-src"))
            .await;
        assert_eq!(monitor.health().status, HealthStatus::Failed);
    }

    #[test]
    fn test_kind_from_directive() {
        assert_eq!(ResourceKind::from_directive("script-src-elem"), ResourceKind::Script);
        assert_eq!(ResourceKind::from_directive("style-src"), ResourceKind::Stylesheet);
        assert_eq!(ResourceKind::from_directive("frame-src"), ResourceKind::Other);
    }

    #[test]
    fn test_config_fallbacks_registered() {
        let mut config = PolicyConfig::default();
        config.fallbacks.insert(TRACKER.to_string(), MIRROR.to_string());
        let (monitor, _) = monitor_with(config, accept_all);
        assert_eq!(monitor.stats().blocked_without_fallback, 0);
        assert_eq!(monitor.lock().fallbacks.get(TRACKER).map(String::as_str), Some(MIRROR));
    }
}
