//! Preloaded asset usage tracking
//!
//! Preloads that nothing consumes waste bandwidth and memory. The tracker
//! records every preload, notes when it is used, and removes the ones still
//! unused after a grace window. Removed URLs are remembered so the same dead
//! preload is not registered again.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use warden_core_resilience::{HealthSource, HealthStatus, SubsystemHealth};

/// Removes preload hints from the host document
pub trait AssetHost: Send + Sync {
    fn remove_preload(&self, url: &str);
}

impl<F> AssetHost for F
where
    F: Fn(&str) + Send + Sync,
{
    fn remove_preload(&self, url: &str) {
        self(url)
    }
}

/// Asset tracker tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfig {
    /// How long a preload may stay unused before it is removed
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,

    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,

    /// Entries older than this and unused for as long are evicted
    #[serde(default = "default_max_cache_age_secs")]
    pub max_cache_age_secs: u64,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window_ms(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            max_cache_age_secs: default_max_cache_age_secs(),
        }
    }
}

impl AssetConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }
}

fn default_grace_window_ms() -> u64 {
    10_000
}

fn default_cache_sweep_interval_secs() -> u64 {
    60
}

fn default_max_cache_age_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadDecision {
    Tracked,
    /// Previously removed as unused; do not preload again
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetMetrics {
    pub asset_count: usize,
    pub unused_count: usize,
    pub total_bytes: u64,
    pub unused_bytes: u64,
    pub total_load_time: Duration,
}

impl AssetMetrics {
    pub fn unused_ratio(&self) -> f64 {
        if self.asset_count == 0 {
            0.0
        } else {
            self.unused_count as f64 / self.asset_count as f64
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedAsset {
    bytes: u64,
    load_time: Duration,
    registered_at: Instant,
    last_used: Option<Instant>,
}

#[derive(Debug, Default)]
struct TrackerState {
    assets: HashMap<String, TrackedAsset>,
    /// Removed preload URLs and when they were removed
    skip: HashMap<String, Instant>,
}

#[derive(Clone)]
pub struct ResourceUsageTracker {
    config: Arc<AssetConfig>,
    host: Arc<dyn AssetHost>,
    state: Arc<Mutex<TrackerState>>,
}

impl std::fmt::Debug for ResourceUsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceUsageTracker")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl ResourceUsageTracker {
    pub fn new(config: AssetConfig, host: Arc<dyn AssetHost>) -> Self {
        Self {
            config: Arc::new(config),
            host,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_preload(&self, url: &str, bytes: u64, load_time: Duration) -> PreloadDecision {
        let mut state = self.lock();
        if state.skip.contains_key(url) {
            debug!(url, "Skipping preload previously found unused");
            return PreloadDecision::Skipped;
        }

        state
            .assets
            .entry(url.to_string())
            .and_modify(|asset| {
                asset.bytes = bytes;
                asset.load_time = load_time;
            })
            .or_insert_with(|| TrackedAsset {
                bytes,
                load_time,
                registered_at: Instant::now(),
                last_used: None,
            });
        PreloadDecision::Tracked
    }

    /// Returns false for URLs that are not tracked
    pub fn mark_used(&self, url: &str) -> bool {
        match self.lock().assets.get_mut(url) {
            Some(asset) => {
                asset.last_used = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Remove preloads still unused after the grace window
    pub fn sweep_unused(&self) -> Vec<String> {
        let now = Instant::now();
        let grace = self.config.grace_window();

        let removed: Vec<String> = {
            let mut state = self.lock();
            let removed: Vec<String> = state
                .assets
                .iter()
                .filter(|(_, asset)| {
                    asset.last_used.is_none() && now.duration_since(asset.registered_at) >= grace
                })
                .map(|(url, _)| url.clone())
                .collect();
            for url in &removed {
                state.assets.remove(url);
                state.skip.insert(url.clone(), now);
            }
            removed
        };

        for url in &removed {
            self.host.remove_preload(url);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Removed unused preloads");
        }
        removed
    }

    /// Evict entries older than the max age that were not used within it
    ///
    /// Skip entries past the same age are forgotten so those URLs may be
    /// preloaded again.
    pub fn sweep_cache(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_cache_age();
        let mut state = self.lock();
        let before = state.assets.len();

        state.assets.retain(|_, asset| {
            let recently_used = asset
                .last_used
                .is_some_and(|used| now.duration_since(used) < max_age);
            now.duration_since(asset.registered_at) < max_age || recently_used
        });

        let evicted = before - state.assets.len();
        state
            .skip
            .retain(|_, removed_at| now.duration_since(*removed_at) < max_age);
        if evicted > 0 {
            debug!(evicted, "Evicted stale asset entries");
        }
        evicted
    }

    pub fn metrics(&self) -> AssetMetrics {
        let state = self.lock();
        let mut metrics = AssetMetrics {
            asset_count: state.assets.len(),
            unused_count: 0,
            total_bytes: 0,
            unused_bytes: 0,
            total_load_time: Duration::ZERO,
        };

        for asset in state.assets.values() {
            metrics.total_bytes += asset.bytes;
            metrics.total_load_time += asset.load_time;
            if asset.last_used.is_none() {
                metrics.unused_count += 1;
                metrics.unused_bytes += asset.bytes;
            }
        }
        metrics
    }

    /// Forget every tracked asset and the skip set
    pub fn clear(&self) {
        let mut state = self.lock();
        state.assets.clear();
        state.skip.clear();
    }

    pub fn config(&self) -> &AssetConfig {
        &self.config
    }
}

impl HealthSource for ResourceUsageTracker {
    fn name(&self) -> &str {
        "asset_tracker"
    }

    fn health(&self) -> SubsystemHealth {
        let metrics = self.metrics();
        let detail = format!("{}/{} unused", metrics.unused_count, metrics.asset_count);
        let status = if metrics.asset_count >= 4 && metrics.unused_ratio() > 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        SubsystemHealth::new(self.name(), status, detail)
    }
}
