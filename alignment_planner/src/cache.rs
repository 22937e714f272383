//! Event cache.
//!
//! Computed event sets are stored per (month or day, location, scene, mode)
//! with an expiry. [`EventCache`] sits in front of a [`CacheStore`] and makes
//! sure a given key is computed at most once at a time: concurrent callers
//! for the same missing key wait for the single computation in flight.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};

use crate::{
    AlignmentEvent, AlignmentPlannerError, AlignmentPlannerResult, SceneFilter, SearchMode,
};

const CACHE_DIR_NAME: &str = "alignment_planner";

/// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one cached event set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub year: i32,
    pub month: u32,
    /// Set for single-day entries, `None` for whole-month entries
    pub day: Option<u32>,
    pub location: String,
    pub scene: SceneFilter,
    /// Concrete mode the events were computed with
    pub mode: SearchMode,
}

impl CacheKey {
    pub fn month(
        year: i32,
        month: u32,
        location: impl Into<String>,
        scene: SceneFilter,
        mode: SearchMode,
    ) -> Self {
        Self {
            year,
            month,
            day: None,
            location: location.into(),
            scene,
            mode,
        }
    }

    pub fn day(
        year: i32,
        month: u32,
        day: u32,
        location: impl Into<String>,
        scene: SceneFilter,
        mode: SearchMode,
    ) -> Self {
        Self {
            day: Some(day),
            ..Self::month(year, month, location, scene, mode)
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.day {
            Some(day) => write!(f, "{:04}-{:02}-{:02}", self.year, self.month, day)?,
            None => write!(f, "{:04}-{:02}", self.year, self.month)?,
        }
        write!(f, ":{}:{}:{}", self.location, self.scene, self.mode)
    }
}

/// A stored event set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// JSON-encoded `Vec<AlignmentEvent>`
    pub events: String,
    pub event_count: usize,
    pub calculation_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// # Errors
    /// `CacheCorruption` when the stored payload does not decode.
    pub fn decode(&self) -> AlignmentPlannerResult<Vec<AlignmentEvent>> {
        serde_json::from_str(&self.events).map_err(|e| {
            AlignmentPlannerError::CacheCorruption(format!("entry {}: {e}", self.key))
        })
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Valid and not expired
    Hit(Vec<AlignmentEvent>),
    /// Present but expired or invalidated
    Stale(Vec<AlignmentEvent>),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_hit(self) -> Option<Vec<AlignmentEvent>> {
        match self {
            CacheLookup::Hit(events) => Some(events),
            _ => None,
        }
    }
}

/// Key-value storage behind the event cache.
///
/// `store` must replace an entry atomically: readers see either the old or
/// the new entry, never a mix.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, key: &str) -> AlignmentPlannerResult<Option<CacheEntry>>;

    async fn store(&self, entry: CacheEntry) -> AlignmentPlannerResult<()>;

    /// Marks an entry invalid; returns whether it existed.
    async fn mark_invalid(&self, key: &str) -> AlignmentPlannerResult<bool>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> AlignmentPlannerError {
        AlignmentPlannerError::StorageError("memory cache lock poisoned".to_string())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, key: &str) -> AlignmentPlannerResult<Option<CacheEntry>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn store(&self, entry: CacheEntry) -> AlignmentPlannerResult<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn mark_invalid(&self, key: &str) -> AlignmentPlannerResult<bool> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        Ok(match entries.get_mut(key) {
            Some(entry) => {
                entry.is_valid = false;
                true
            }
            None => false,
        })
    }
}

/// One JSON file per entry under a cache directory.
///
/// Writes and invalidations through one store (and its clones) are
/// serialized, so an invalidation never overwrites a newer entry.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Store under the platform's local data directory.
    pub fn in_default_dir() -> AlignmentPlannerResult<Self> {
        let data_dir = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .ok_or_else(|| {
                AlignmentPlannerError::StorageError(
                    "Could not determine cache directory".to_string(),
                )
            })?;
        Ok(Self::new(data_dir.join(CACHE_DIR_NAME).join("events")))
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    fn tmp_path_for(path: &Path) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("json.{}.{n}.tmp", std::process::id()))
    }

    /// Writes aside, then renames over the old file. Callers hold `writes`.
    async fn write_entry(&self, entry: &CacheEntry) -> AlignmentPlannerResult<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            AlignmentPlannerError::StorageError(format!("Failed to create cache directory: {e}"))
        })?;

        let path = self.path_for(&entry.key);
        let tmp_path = Self::tmp_path_for(&path);
        let serialized = serde_json::to_string(entry).map_err(|e| {
            AlignmentPlannerError::StorageError(format!("Failed to encode cache entry: {e}"))
        })?;

        tokio::fs::write(&tmp_path, serialized).await.map_err(|e| {
            AlignmentPlannerError::StorageError(format!("Failed to write cache file: {e}"))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AlignmentPlannerError::StorageError(format!(
                "Failed to replace cache file: {e}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn load(&self, key: &str) -> AlignmentPlannerResult<Option<CacheEntry>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AlignmentPlannerError::StorageError(format!(
                    "Failed to read cache file {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            AlignmentPlannerError::CacheCorruption(format!("{}: {e}", path.display()))
        })
    }

    async fn store(&self, entry: CacheEntry) -> AlignmentPlannerResult<()> {
        let _writing = self.writes.lock().await;
        self.write_entry(&entry).await
    }

    async fn mark_invalid(&self, key: &str) -> AlignmentPlannerResult<bool> {
        let _writing = self.writes.lock().await;
        match self.load(key).await? {
            Some(mut entry) => {
                entry.is_valid = false;
                self.write_entry(&entry).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

type Flight = Arc<OnceCell<AlignmentPlannerResult<Arc<Vec<AlignmentEvent>>>>>;

/// Cache front with TTL handling and per-key request collapsing.
pub struct EventCache<S> {
    store: S,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl<S: CacheStore> EventCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reads `key`. Entries that fail to decode are reported as misses.
    pub async fn get(&self, key: &CacheKey) -> AlignmentPlannerResult<CacheLookup> {
        let storage_key = key.to_string();
        let entry = match self.store.load(&storage_key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(CacheLookup::Miss),
            Err(AlignmentPlannerError::CacheCorruption(reason)) => {
                warn!("discarding corrupt cache entry {storage_key}: {reason}");
                return Ok(CacheLookup::Miss);
            }
            Err(e) => return Err(e),
        };

        let events = match entry.decode() {
            Ok(events) => events,
            Err(e) => {
                warn!("discarding corrupt cache entry {storage_key}: {e}");
                return Ok(CacheLookup::Miss);
            }
        };

        if entry.is_valid && !entry.is_expired(Utc::now()) {
            Ok(CacheLookup::Hit(events))
        } else {
            Ok(CacheLookup::Stale(events))
        }
    }

    /// Stores `events` under `key` for `ttl`, replacing any previous entry.
    pub async fn put(
        &self,
        key: &CacheKey,
        events: &[AlignmentEvent],
        ttl: Duration,
    ) -> AlignmentPlannerResult<()> {
        self.put_timed(key, events, ttl, std::time::Duration::ZERO)
            .await
    }

    /// Like [`put`](Self::put), also recording how long the computation took.
    pub async fn put_timed(
        &self,
        key: &CacheKey,
        events: &[AlignmentEvent],
        ttl: Duration,
        calculation: std::time::Duration,
    ) -> AlignmentPlannerResult<()> {
        let storage_key = key.to_string();
        let now = Utc::now();
        let created_at = match self.store.load(&storage_key).await {
            Ok(Some(previous)) => previous.created_at,
            _ => now,
        };
        let payload = serde_json::to_string(events).map_err(|e| {
            AlignmentPlannerError::StorageError(format!("Failed to encode events: {e}"))
        })?;

        self.store
            .store(CacheEntry {
                key: storage_key,
                events: payload,
                event_count: events.len(),
                calculation_ms: calculation.as_millis() as u64,
                created_at,
                updated_at: now,
                expires_at: now + ttl,
                is_valid: true,
            })
            .await
    }

    /// Invalidates `key`; returns whether an entry existed.
    pub async fn invalidate(&self, key: &CacheKey) -> AlignmentPlannerResult<bool> {
        self.store.mark_invalid(&key.to_string()).await
    }

    /// Returns the cached events for `key`, computing and storing them on a
    /// miss. Concurrent callers for the same key share one computation.
    ///
    /// # Errors
    /// Errors of the computation are handed to every waiter and nothing is
    /// stored; the next call computes again. A failure to store a successful
    /// computation is only logged.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> AlignmentPlannerResult<Vec<AlignmentEvent>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AlignmentPlannerResult<Vec<AlignmentEvent>>>,
    {
        if let CacheLookup::Hit(events) = self.get(key).await? {
            debug!("cache hit {key}");
            return Ok(events);
        }

        let storage_key = key.to_string();
        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(storage_key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = flight
            .get_or_init(|| async {
                // A flight that finished just before this one was registered
                // has already stored its result
                if let CacheLookup::Hit(events) = self.get(key).await? {
                    return Ok(Arc::new(events));
                }
                debug!("cache miss {key}, computing");
                let started = std::time::Instant::now();
                let events = compute().await?;
                if let Err(e) = self.put_timed(key, &events, ttl, started.elapsed()).await {
                    warn!("computed {key} but could not cache it: {e}");
                }
                Ok(Arc::new(events))
            })
            .await
            .clone();

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .get(&storage_key)
                .is_some_and(|current| Arc::ptr_eq(current, &flight))
            {
                in_flight.remove(&storage_key);
            }
        }

        result.map(|events| events.as_ref().clone())
    }
}
