/*!
 * Persistent store adapter
 *
 * Key/value storage that keeps working when the persistent backend does not.
 * Every write lands in memory first and is mirrored to the backend when the
 * backend accepts it. A backend failure flips the adapter into `blocked` mode,
 * where it serves from memory alone until a canary probe succeeds and the
 * live entries are mirrored back. Removals made while blocked are kept as
 * tombstones and replayed against the backend before that mirror.
 *
 * Callers never see a backend error; they see `StoreWrite::MemoryOnly`.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_core_resilience::{HealthSource, HealthStatus, SubsystemHealth};

use crate::error::{Result, WardenError};

/// Persistent key/value backend
///
/// Implementations report privacy restrictions, quota errors and the like as
/// errors; the adapter decides what to do with them.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Every key currently held, including keys owned by other applications
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-process backend, shared between clones
///
/// Can be switched into a failing mode to emulate a browser that refuses
/// storage access.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, String>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw number of keys held
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(WardenError::Backend("storage access denied".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.data().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.data().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.data().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.data().keys().cloned().collect())
    }
}

/// One file per key inside a directory
///
/// Keys are percent-encoded into file names. A read-only or vanished
/// directory surfaces as an I/O error, which the adapter treats as blocked.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry.file_name().to_str().and_then(decode_key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Store adapter tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix for every key this adapter owns in the backend
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL applied when `set` is called without one
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Interval between canary probes
    #[serde(default = "default_canary_interval_secs")]
    pub canary_interval_secs: u64,

    /// Directory for the file backend (None = in-process backend)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl_secs(),
            canary_interval_secs: default_canary_interval_secs(),
            data_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn canary_interval(&self) -> Duration {
        Duration::from_secs(self.canary_interval_secs)
    }
}

fn default_key_prefix() -> String {
    "warden:".to_string()
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_canary_interval_secs() -> u64 {
    30
}

/// Where a write ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWrite {
    /// In memory and mirrored to the backend
    Persisted,
    /// In memory only; the backend is blocked or refused the write
    MemoryOnly,
}

/// Result of a canary probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanaryResult {
    /// Backend accepted the probe; live entries were mirrored back
    Available { remirrored: usize },
    /// Backend still refuses access
    Unavailable,
}

/// Snapshot of adapter state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    /// Result of the most recent canary probe (true before the first one)
    pub persistent_available: bool,
    /// Backend writes are suspended
    pub blocked: bool,
    pub memory_entries: usize,
}

/// Persisted form of an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    payload: String,
    stored_at: DateTime<Utc>,
    ttl_ms: u64,
}

impl Envelope {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone)]
struct StoreEntry {
    payload: String,
    created_at: Instant,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

impl StoreEntry {
    fn new(payload: String, ttl: Duration) -> Self {
        Self {
            payload,
            created_at: Instant::now(),
            stored_at: Utc::now(),
            ttl,
        }
    }

    /// Rebuild from a persisted envelope, keeping its remaining lifetime
    fn restored(envelope: Envelope, age: Duration) -> Self {
        let now = Instant::now();
        Self {
            ttl: envelope.ttl(),
            created_at: now.checked_sub(age).unwrap_or(now),
            stored_at: envelope.stored_at,
            payload: envelope.payload,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }

    fn envelope(&self) -> Envelope {
        Envelope {
            payload: self.payload.clone(),
            stored_at: self.stored_at,
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}

#[derive(Debug)]
struct StoreState {
    entries: HashMap<String, StoreEntry>,
    blocked: bool,
    persistent_available: bool,
    /// Keys removed while the backend was unreachable
    tombstones: HashSet<String>,
    /// A prefix clear is owed to the backend
    clear_pending: bool,
}

/// Memory-first key/value store with opportunistic persistence
#[derive(Clone)]
pub struct PersistentStoreAdapter {
    config: Arc<StoreConfig>,
    backend: Arc<dyn KeyValueBackend>,
    state: Arc<Mutex<StoreState>>,
}

impl std::fmt::Debug for PersistentStoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStoreAdapter")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

impl PersistentStoreAdapter {
    pub fn new(config: StoreConfig, backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            state: Arc::new(Mutex::new(StoreState {
                entries: HashMap::new(),
                blocked: false,
                persistent_available: true,
                tombstones: HashSet::new(),
                clear_pending: false,
            })),
        }
    }

    /// Adapter over an in-process backend
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(config, Arc::new(MemoryBackend::new()))
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backend_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn canary_key(&self) -> String {
        format!("{}__canary__", self.config.key_prefix)
    }

    fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    fn mark_blocked(&self, op: &str, err: &WardenError) {
        let mut state = self.lock();
        if !state.blocked {
            warn!(operation = op, error = %err, "Persistent storage blocked, serving from memory");
        }
        state.blocked = true;
        state.persistent_available = false;
    }

    fn defer_remove(&self, key: &str) {
        self.lock().tombstones.insert(key.to_string());
    }

    fn defer_clear(&self) {
        let mut state = self.lock();
        state.clear_pending = true;
        state.tombstones.clear();
    }

    /// Store a payload; `ttl` of None uses the configured default
    pub async fn set(
        &self,
        key: &str,
        payload: impl Into<String>,
        ttl: Option<Duration>,
    ) -> StoreWrite {
        let entry = StoreEntry::new(payload.into(), ttl.unwrap_or(self.config.default_ttl()));
        let envelope = entry.envelope();

        let blocked = {
            let mut state = self.lock();
            state.entries.insert(key.to_string(), entry);
            state.tombstones.remove(key);
            state.blocked
        };

        if blocked {
            debug!(key, "Store blocked, write kept in memory");
            return StoreWrite::MemoryOnly;
        }

        let encoded = match serde_json::to_string(&envelope) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode store envelope");
                return StoreWrite::MemoryOnly;
            }
        };

        match self.backend.set(&self.backend_key(key), &encoded).await {
            Ok(()) => StoreWrite::Persisted,
            Err(e) => {
                self.mark_blocked("set", &e);
                StoreWrite::MemoryOnly
            }
        }
    }

    /// Fetch a payload; expired and pending-removal entries are misses
    pub async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let (expired, blocked) = {
            let mut state = self.lock();
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.payload.clone()),
                Some(_) => {
                    state.entries.remove(key);
                    (true, state.blocked)
                }
                // The backend may still hold a copy we owe a delete for
                None if state.clear_pending || state.tombstones.contains(key) => return None,
                None => (false, state.blocked),
            }
        };

        if blocked {
            return None;
        }

        let backend_key = self.backend_key(key);
        if expired {
            if let Err(e) = self.backend.remove(&backend_key).await {
                self.mark_blocked("remove", &e);
                self.defer_remove(key);
            }
            return None;
        }

        let raw = match self.backend.get(&backend_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.mark_blocked("get", &e);
                return None;
            }
        };

        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable persisted entry");
                let _ = self.backend.remove(&backend_key).await;
                return None;
            }
        };

        let age = envelope.age(Utc::now());
        if age >= envelope.ttl() {
            debug!(key, "Persisted entry expired");
            let _ = self.backend.remove(&backend_key).await;
            return None;
        }

        let mut state = self.lock();
        // A concurrent set wins over the backend copy
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoreEntry::restored(envelope, age));
        Some(entry.payload.clone())
    }

    /// Remove a key; returns whether it was held in memory
    pub async fn remove(&self, key: &str) -> bool {
        let (existed, blocked) = {
            let mut state = self.lock();
            let existed = state.entries.remove(key).is_some();
            if state.blocked {
                state.tombstones.insert(key.to_string());
            }
            (existed, state.blocked)
        };

        if !blocked {
            if let Err(e) = self.backend.remove(&self.backend_key(key)).await {
                self.mark_blocked("remove", &e);
                self.defer_remove(key);
            }
        }

        existed
    }

    /// Remove every key carrying the application prefix
    ///
    /// Keys belonging to other applications in the same backend are left
    /// untouched.
    pub async fn clear(&self) -> usize {
        let (cleared, blocked) = {
            let mut state = self.lock();
            let cleared = state.entries.len();
            state.entries.clear();
            (cleared, state.blocked)
        };

        if blocked {
            self.defer_clear();
            return cleared;
        }

        if let Err(e) = self.clear_backend().await {
            self.mark_blocked("clear", &e);
            self.defer_clear();
        }

        debug!(cleared, "Store cleared");
        cleared
    }

    /// Remove every prefixed key from the backend
    async fn clear_backend(&self) -> Result<()> {
        let keys = self.backend.keys().await?;
        for key in keys
            .iter()
            .filter(|k| k.starts_with(self.config.key_prefix.as_str()))
        {
            self.backend.remove(key).await?;
        }
        Ok(())
    }

    /// Apply removals recorded while blocked; returns how many were owed
    async fn replay_removals(&self, tombstones: &[String], clear_pending: bool) -> Result<usize> {
        if clear_pending {
            self.clear_backend().await?;
            return Ok(1);
        }
        for key in tombstones {
            self.backend.remove(&self.backend_key(key)).await?;
        }
        Ok(tombstones.len())
    }

    /// Serialize a value as JSON and store it
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<StoreWrite> {
        let payload = serde_json::to_string(value)?;
        Ok(self.set(key, payload, ttl).await)
    }

    /// Fetch and deserialize a JSON value; unreadable payloads are misses
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.get(key).await?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Stored payload is not valid for the requested type");
                None
            }
        }
    }

    /// Trivial write and delete against the backend
    ///
    /// Success clears `blocked`, replays removals made while blocked and
    /// mirrors every live memory entry back.
    pub async fn probe_canary(&self) -> CanaryResult {
        let canary = self.canary_key();
        let probe = async {
            self.backend.set(&canary, "1").await?;
            self.backend.remove(&canary).await
        };

        if let Err(e) = probe.await {
            self.mark_blocked("canary", &e);
            return CanaryResult::Unavailable;
        }

        let (was_blocked, tombstones, clear_pending) = {
            let mut state = self.lock();
            let was_blocked = state.blocked;
            state.blocked = false;
            state.persistent_available = true;
            let tombstones: Vec<String> = state.tombstones.iter().cloned().collect();
            (was_blocked, tombstones, state.clear_pending)
        };

        if !was_blocked && tombstones.is_empty() && !clear_pending {
            return CanaryResult::Available { remirrored: 0 };
        }

        let replayed = match self.replay_removals(&tombstones, clear_pending).await {
            Ok(replayed) => replayed,
            Err(e) => {
                self.mark_blocked("replay", &e);
                return CanaryResult::Unavailable;
            }
        };

        let live: Vec<(String, Envelope)> = {
            let mut state = self.lock();
            for key in &tombstones {
                state.tombstones.remove(key);
            }
            if clear_pending {
                state.clear_pending = false;
            }
            let now = Instant::now();
            let live = state
                .entries
                .iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(key, entry)| (key.clone(), entry.envelope()))
                .collect();
            live
        };
        if replayed > 0 {
            debug!(replayed, "Deferred removals applied to backend");
        }

        let mut remirrored = 0;
        for (key, envelope) in live {
            let encoded = match serde_json::to_string(&envelope) {
                Ok(encoded) => encoded,
                Err(_) => continue,
            };
            if let Err(e) = self.backend.set(&self.backend_key(&key), &encoded).await {
                self.mark_blocked("remirror", &e);
                return CanaryResult::Unavailable;
            }
            remirrored += 1;
        }

        info!(remirrored, "Persistent storage available again");
        CanaryResult::Available { remirrored }
    }

    /// Drop ttl-expired entries from memory and the backend
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let (expired, blocked) = {
            let mut state = self.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.entries.remove(key);
            }
            (expired, state.blocked)
        };

        if !blocked {
            for key in &expired {
                if let Err(e) = self.backend.remove(&self.backend_key(key)).await {
                    self.mark_blocked("remove", &e);
                    break;
                }
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired store entries swept");
        }
        expired.len()
    }

    /// Full-recovery reset: sweep and re-probe; live data is kept
    pub async fn reset(&self) -> CanaryResult {
        self.sweep_expired().await;
        self.probe_canary().await
    }

    pub fn status(&self) -> StoreStatus {
        let state = self.lock();
        StoreStatus {
            persistent_available: state.persistent_available,
            blocked: state.blocked,
            memory_entries: state.entries.len(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl HealthSource for PersistentStoreAdapter {
    fn name(&self) -> &str {
        "persistent_store"
    }

    fn health(&self) -> SubsystemHealth {
        let status = self.status();
        if status.blocked {
            SubsystemHealth::new(
                self.name(),
                HealthStatus::Degraded,
                format!("memory only ({} entries)", status.memory_entries),
            )
        } else {
            SubsystemHealth::new(self.name(), HealthStatus::Healthy, "persistent")
        }
    }
}
