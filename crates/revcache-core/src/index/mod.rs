//! Metadata index: resource key → [`CacheEntry`].
//!
//! Held in memory for every freshness decision and persisted to a single JSON
//! document:
//!
//! ```text
//! {"/kcs2/img.png": {"version": "abc123", "lastmodified": "Tue, 01 Oct 2024 00:00:00 GMT", "length": 5120, "cache": "max-age=2592000"}}
//! ```
//!
//! Saves are debounced through [`MetadataIndex::queue_save`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CacheResult;

pub(crate) mod persist;

use persist::{GateStep, SaveGate};

/// Cached metadata for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Version tag the cached blob was last confirmed for.
    pub version: String,

    /// `Last-Modified` of the cached blob, sent back as `If-Modified-Since`.
    #[serde(
        rename = "lastmodified",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<String>,

    /// Blob length in bytes.
    #[serde(default)]
    pub length: u64,

    /// Origin `Cache-Control` header.
    #[serde(rename = "cache", default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

/// In-memory index with debounced persistence.
#[derive(Debug)]
pub struct MetadataIndex {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    gate: Mutex<SaveGate>,
    /// Serializes durable writes between the timer worker and explicit flushes.
    write_lock: tokio::sync::Mutex<()>,
    saves: AtomicU64,
}

impl MetadataIndex {
    /// Load the index at `path`, promoting an interrupted save's backup first.
    pub async fn load(path: impl Into<PathBuf>, quiet: Duration, cap: u32) -> CacheResult<Arc<Self>> {
        let path = path.into();
        let entries = persist::recover(&path).await?;
        info!(path = %path.display(), entries = entries.len(), "loaded cache index");

        Ok(Arc::new(Self {
            path,
            entries: RwLock::new(entries),
            gate: Mutex::new(SaveGate::new(quiet, cap)),
            write_lock: tokio::sync::Mutex::new(()),
            saves: AtomicU64::new(0),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Create or replace an entry.
    pub async fn insert(&self, key: &str, entry: CacheEntry) {
        self.entries.write().await.insert(key.to_string(), entry);
    }

    /// Confirm the cached blob for a new version tag. Returns the updated entry.
    pub async fn set_version(&self, key: &str, version: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key)?;
        entry.version = version.to_string();
        Some(entry.clone())
    }

    /// Correct the recorded length ahead of the blob write.
    pub async fn set_length(&self, key: &str, length: u64) -> bool {
        match self.entries.write().await.get_mut(key) {
            Some(entry) => {
                entry.length = length;
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy, ordered by key.
    pub async fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of completed durable writes.
    pub fn saves_completed(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Schedule a debounced save.
    ///
    /// Each call pushes the flush a quiet period past the latest call until the
    /// trigger cap is reached; after that the pending flush keeps its time, so
    /// a steady stream of updates cannot postpone it forever.
    pub fn queue_save(self: &Arc<Self>) {
        let spawn_worker = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trigger(Instant::now());

        if spawn_worker {
            let index = Arc::clone(self);
            tokio::spawn(async move { index.run_save_timer().await });
        }
    }

    async fn run_save_timer(self: Arc<Self>) {
        loop {
            let step = self
                .gate
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .poll(Instant::now());

            match step {
                GateStep::Idle => return,
                GateStep::Wait(deadline) => tokio::time::sleep_until(deadline).await,
                GateStep::Flush => {
                    if let Err(e) = self.save_now().await {
                        warn!(error = %e, "failed to save cache index");
                    }
                    self.gate
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .flushed();
                }
            }
        }
    }

    /// Write the index now.
    pub async fn save_now(&self) -> CacheResult<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot().await;
        persist::write_swapped(&self.path, &snapshot).await?;
        self.saves.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), entries = snapshot.len(), "saved cache index");
        Ok(())
    }
}
