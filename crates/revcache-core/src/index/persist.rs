//! Index persistence: debounce gate, crash-safe swap, startup recovery.
//!
//! The durable write keeps the previous index under `<index>.bak` until the
//! new one is fully written:
//!
//! ```text
//! 1. rename cache.json      -> cache.json.bak
//! 2. write  cache.json
//! 3. remove cache.json.bak
//! ```
//!
//! A crash between 1 and 3 leaves the backup behind; [`recover`] promotes it on
//! the next start.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

use super::CacheEntry;

/// Suffix of the backup index kept while a save is in progress.
pub const BACKUP_SUFFIX: &str = ".bak";

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Trailing debounce with a cap on how often the pending flush is postponed.
#[derive(Debug)]
pub(crate) struct SaveGate {
    quiet: Duration,
    cap: u32,
    triggers: u32,
    deadline: Option<Instant>,
    worker_running: bool,
}

/// What the timer worker should do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GateStep {
    /// Nothing pending; the worker exits.
    Idle,
    /// Sleep until the deadline, then poll again.
    Wait(Instant),
    /// Deadline reached; flush now.
    Flush,
}

impl SaveGate {
    pub(crate) fn new(quiet: Duration, cap: u32) -> Self {
        Self {
            quiet,
            cap,
            triggers: 0,
            deadline: None,
            worker_running: false,
        }
    }

    /// Record a save request. Returns `true` when a timer worker must be spawned.
    pub(crate) fn trigger(&mut self, now: Instant) -> bool {
        self.triggers = self.triggers.saturating_add(1);

        if self.triggers < self.cap || self.deadline.is_none() {
            self.deadline = Some(now + self.quiet);
        }

        if self.worker_running {
            false
        } else {
            self.worker_running = true;
            true
        }
    }

    pub(crate) fn poll(&mut self, now: Instant) -> GateStep {
        match self.deadline {
            None => {
                self.worker_running = false;
                GateStep::Idle
            }
            Some(deadline) if deadline > now => GateStep::Wait(deadline),
            Some(_) => {
                self.deadline = None;
                self.triggers = 0;
                GateStep::Flush
            }
        }
    }

    /// Called once the durable write finished.
    pub(crate) fn flushed(&mut self) {
        self.triggers = 0;
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Promote a leftover backup and load the index.
pub(crate) async fn recover(path: &Path) -> CacheResult<HashMap<String, CacheEntry>> {
    let backup = backup_path(path);

    if fs::try_exists(&backup).await.unwrap_or(false) {
        warn!(
            path = %path.display(),
            "previous index save was interrupted, restoring backup"
        );
        if fs::try_exists(path).await.unwrap_or(false) {
            fs::remove_file(path).await.map_err(|e| CacheError::Index {
                message: format!("failed to remove stale index: {}", e),
            })?;
        }
        fs::rename(&backup, path)
            .await
            .map_err(|e| CacheError::Index {
                message: format!("failed to restore index backup: {}", e),
            })?;
    }

    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no index yet, starting empty");
            return Ok(HashMap::new());
        }
        Err(e) => {
            return Err(CacheError::Index {
                message: format!("failed to read index: {}", e),
            })
        }
    };

    match serde_json::from_slice(&content) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            // Entries only steer freshness; an unreadable index means refetching.
            warn!(
                path = %path.display(),
                error = %e,
                "index is unreadable, starting empty"
            );
            Ok(HashMap::new())
        }
    }
}

/// Write `snapshot` to `path` keeping the previous index as a backup meanwhile.
pub(crate) async fn write_swapped(
    path: &Path,
    snapshot: &BTreeMap<String, CacheEntry>,
) -> CacheResult<()> {
    let json = serde_json::to_vec(snapshot).map_err(|e| CacheError::Index {
        message: format!("failed to serialize index: {}", e),
    })?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::Index {
                message: format!("failed to create index directory: {}", e),
            })?;
    }

    let backup = backup_path(path);

    if fs::try_exists(path).await.unwrap_or(false) {
        fs::rename(path, &backup)
            .await
            .map_err(|e| CacheError::Index {
                message: format!("failed to move index to backup: {}", e),
            })?;
    }

    fs::write(path, &json).await.map_err(|e| CacheError::Index {
        message: format!("failed to write index: {}", e),
    })?;

    if fs::try_exists(&backup).await.unwrap_or(false) {
        fs::remove_file(&backup)
            .await
            .map_err(|e| CacheError::Index {
                message: format!("failed to remove index backup: {}", e),
            })?;
    }

    Ok(())
}
