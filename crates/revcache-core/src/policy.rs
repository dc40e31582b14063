//! Caller-owned policy consulted by the lookup engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::resource::ResourceKey;

/// Blacklist/invalidation predicates.
pub trait ResourcePolicy: Send + Sync {
    /// Resource must never be served from cache.
    fn is_blacklisted(&self, key: &ResourceKey) -> bool;

    /// Resource is currently suspect and must be revalidated and served without
    /// long-lived cache headers.
    fn is_invalidated(&self, key: &ResourceKey) -> bool;
}

#[derive(Debug, Default)]
struct FlagState {
    raised: bool,
    /// Keys fetched cleanly since the flag was last raised.
    refreshed: HashSet<String>,
}

/// Process-wide "origin authority is suspect" marker.
///
/// Raised by stale fallbacks. While raised, each targeted key stays
/// invalidated until [`InvalidationFlag::mark_clean`] records a clean fetch of it.
#[derive(Debug, Clone, Default)]
pub struct InvalidationFlag {
    state: Arc<Mutex<FlagState>>,
}

impl InvalidationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut state = self.lock();
        if !state.raised {
            warn!("origin marked suspect, manifests will be revalidated");
        }
        state.raised = true;
        state.refreshed.clear();
    }

    pub fn is_raised(&self) -> bool {
        self.lock().raised
    }

    /// Record a clean origin fetch of `key`.
    pub fn mark_clean(&self, key: &ResourceKey) {
        let mut state = self.lock();
        if state.raised {
            state.refreshed.insert(key.as_str().to_string());
        }
    }

    /// Whether `key` still awaits a clean fetch.
    pub fn is_suspect(&self, key: &ResourceKey) -> bool {
        let state = self.lock();
        state.raised && !state.refreshed.contains(key.as_str())
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        if state.raised {
            info!("origin suspect flag cleared");
        }
        state.raised = false;
        state.refreshed.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlagState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Static name tables: a blacklist and the manifests covered by the flag.
///
/// Blacklist entries ending in `/` match every key below that directory.
#[derive(Debug, Clone)]
pub struct NameTables {
    blacklist: Vec<String>,
    manifests: HashSet<String>,
    flag: InvalidationFlag,
}

impl NameTables {
    pub fn new(
        blacklist: impl IntoIterator<Item = String>,
        manifests: impl IntoIterator<Item = String>,
        flag: InvalidationFlag,
    ) -> Self {
        Self {
            blacklist: blacklist.into_iter().collect(),
            manifests: manifests.into_iter().collect(),
            flag,
        }
    }

    pub fn is_manifest(&self, key: &ResourceKey) -> bool {
        self.manifests.contains(key.as_str())
    }
}

impl ResourcePolicy for NameTables {
    fn is_blacklisted(&self, key: &ResourceKey) -> bool {
        let key = key.as_str();
        self.blacklist.iter().any(|name| {
            if name.ends_with('/') {
                key.starts_with(name.as_str())
            } else {
                key == name
            }
        })
    }

    fn is_invalidated(&self, key: &ResourceKey) -> bool {
        self.is_manifest(key) && self.flag.is_suspect(key)
    }
}
