//! Lookup/decision engine.
//!
//! ```text
//! LOOKUP ─┬─ HIT ────────────────────────────────► SERVED
//!         ├─ REVALIDATE ─┐                        STALE_FALLBACK
//!         └─ FETCH ──────┴─ coalescer ─ origin ─► NOT_MODIFIED_PASSTHROUGH
//!                                                 ERROR_PASSTHROUGH
//!                                                 GATEWAY_FAILURE
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CacheError, CacheResult};
use crate::flight::{Flight, SingleFlight};
use crate::index::{CacheEntry, MetadataIndex};
use crate::policy::{InvalidationFlag, ResourcePolicy};
use crate::resource::{ResourceKey, ResourceRequest};
use crate::revalidate::{Disposition, RevalidateRequest, Revalidator, SharedOutcome};
use crate::store::ContentStore;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// How the engine decided to satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Served from disk, no origin contact.
    Hit,
    /// Conditional fetch against a cached copy.
    Revalidate,
    /// Unconditional fetch.
    Fetch,
}

/// Per-request options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// Skip the disk hit and fetch unconditionally.
    pub force_refresh: bool,
    /// Client headers forwarded to the origin.
    pub headers: HeaderMap,
}

impl LookupOptions {
    pub fn with_force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Engine output handed to response assembly.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub key: ResourceKey,
    pub route: Route,
    pub status: u16,
    pub contents: Option<Bytes>,
    pub entry: Option<CacheEntry>,
    pub disposition: Disposition,
}

/// The cache engine: index, content store, coalescer and origin client.
pub struct CacheEngine {
    store: ContentStore,
    index: Arc<MetadataIndex>,
    flights: SingleFlight<SharedOutcome>,
    revalidator: Revalidator,
    policy: Arc<dyn ResourcePolicy>,
    flag: InvalidationFlag,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("root", &self.store.root())
            .field("index", &self.index.path())
            .field("in_flight", &self.flights.in_flight())
            .finish()
    }
}

impl CacheEngine {
    /// Recover and load the index, then build the engine. Must complete before
    /// the first request is served.
    pub async fn open(
        config: EngineConfig,
        policy: Arc<dyn ResourcePolicy>,
        flag: InvalidationFlag,
    ) -> CacheResult<Self> {
        let index = MetadataIndex::load(
            config.index_path(),
            Duration::from_millis(config.save_quiet_ms),
            config.save_trigger_cap,
        )
        .await?;
        let store = ContentStore::new(config.cache_root.clone());
        let revalidator = Revalidator::new(&config, store.clone(), Arc::clone(&index), flag.clone())?;

        if config.origin_timeout_secs.is_none() {
            debug!("no origin timeout configured, relying on transport defaults");
        }

        Ok(Self {
            store,
            index,
            flights: SingleFlight::new(),
            revalidator,
            policy,
            flag,
        })
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn flag(&self) -> &InvalidationFlag {
        &self.flag
    }

    pub fn policy(&self) -> &dyn ResourcePolicy {
        self.policy.as_ref()
    }

    /// Number of origin fetches (including their background writes) outstanding.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Parse `url` and resolve it.
    pub async fn lookup(&self, url: &str, opts: &LookupOptions) -> CacheResult<Resolved> {
        let req = ResourceRequest::parse(url)?;
        self.resolve(&req, opts).await
    }

    /// Fetch `url` into the cache without a client waiting on it.
    ///
    /// Outcomes without content (a bare 304) have nobody to go to and come
    /// back as `None`.
    pub async fn prime(&self, url: &str) -> CacheResult<Option<Resolved>> {
        let resolved = self.lookup(url, &LookupOptions::default()).await?;
        Ok(resolved.contents.is_some().then_some(resolved))
    }

    /// Decide HIT / REVALIDATE / FETCH for `req` and carry it out.
    ///
    /// Origin statuses >= 500 that carry a body surface as
    /// [`CacheError::Upstream`].
    pub async fn resolve(&self, req: &ResourceRequest, opts: &LookupOptions) -> CacheResult<Resolved> {
        let key = &req.key;
        let content_path = self.store.path_for(key);
        let entry = self.index.get(key.as_str()).await;
        let cached = entry.is_some() && self.store.exists(&content_path).await;

        if let Some(entry) = entry.as_ref().filter(|_| cached && !opts.force_refresh) {
            if req.version.accepts(&entry.version)
                && !self.policy.is_blacklisted(key)
                && !self.policy.is_invalidated(key)
            {
                let contents = self.store.read(&content_path).await?;
                debug!(key = %key, version = %req.version, "cache hit");
                return Ok(Resolved {
                    key: key.clone(),
                    route: Route::Hit,
                    status: 200,
                    contents: Some(contents),
                    entry: Some(entry.clone()),
                    disposition: Disposition::Served,
                });
            }
        }

        // A forced refresh bypasses the cached copy entirely.
        let route = if cached && !opts.force_refresh {
            Route::Revalidate
        } else {
            Route::Fetch
        };
        let last_modified = match route {
            Route::Revalidate => entry.and_then(|e| e.last_modified),
            _ => None,
        };

        let result = match self.flights.begin(key.as_str()) {
            Flight::Leader(leader) => {
                let job = RevalidateRequest {
                    content_path,
                    key: key.clone(),
                    url: req.origin_url().to_string(),
                    version: req.version.clone(),
                    last_modified,
                    headers: opts.headers.clone(),
                };
                // The fetch owns the leader on its own task, so a caller that
                // goes away mid-fetch does not take its waiters down with it.
                let revalidator = self.revalidator.clone();
                tokio::spawn(async move { revalidator.run(job, leader).await })
                    .await
                    .unwrap_or_else(|e| {
                        warn!(key = %key, error = %e, "origin fetch task failed");
                        Err(CacheError::Flight {
                            key: key.to_string(),
                        })
                    })
            }
            Flight::Waiter(waiter) => waiter.wait().await.and_then(|outcome| outcome),
        };
        let outcome = result?;

        if outcome.status >= 500 {
            if let Some(body) = outcome.contents {
                return Err(CacheError::Upstream {
                    status: outcome.status,
                    body,
                });
            }
        }

        Ok(Resolved {
            key: key.clone(),
            route,
            status: outcome.status,
            contents: outcome.contents,
            entry: outcome.entry,
            disposition: outcome.disposition,
        })
    }

    /// Entry for `url`, if cached.
    pub async fn entry(&self, url: &str) -> CacheResult<Option<CacheEntry>> {
        let req = ResourceRequest::parse(url)?;
        Ok(self.index.get(req.key.as_str()).await)
    }

    /// Whether the blob on disk disagrees with the recorded length.
    pub async fn length_mismatch(&self, key: &ResourceKey) -> bool {
        let Some(entry) = self.index.get(key.as_str()).await else {
            return false;
        };
        match self.store.len(&self.store.path_for(key)).await {
            Some(on_disk) if on_disk != entry.length => {
                debug!(key = %key, recorded = entry.length, on_disk, "length mismatch");
                true
            }
            _ => false,
        }
    }

    /// Wait for outstanding fetches and their writes, then save the index.
    ///
    /// Gives up waiting after `drain_timeout`; the index is saved either way.
    pub async fn shutdown(&self, drain_timeout: Duration) -> CacheResult<()> {
        let drained = tokio::time::timeout(drain_timeout, async {
            while self.flights.in_flight() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = self.flights.in_flight(),
                "shutting down with fetches still outstanding"
            );
        }

        self.index.save_now().await?;
        info!(entries = self.index.len().await, "cache index saved");
        Ok(())
    }
}
