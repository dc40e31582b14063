//! Revalidation controller: conditional fetch against the origin and
//! reconciliation with the content store and index.
//!
//! | Origin answer                  | Cached copy | Result                                  |
//! |--------------------------------|-------------|-----------------------------------------|
//! | transport failure              | yes         | 200 + cached bytes, flag raised          |
//! | transport failure              | no          | 502 + fixed body                         |
//! | 304                            | yes         | 200 + cached bytes, version updated      |
//! | 304                            | no          | bare 304                                 |
//! | 403                            | yes         | 200 + cached bytes, flag raised          |
//! | other >= 400                   | any         | passed through, not cached               |
//! | anything else                  | any         | fetched bytes, blob + entry replaced     |
//!
//! Every branch completes the caller's [`FlightLeader`] exactly once. The
//! refresh branch returns to the caller before the blob is on disk and
//! completes the flight from a background task once the write is done.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CacheError, CacheResult};
use crate::flight::FlightLeader;
use crate::index::{CacheEntry, MetadataIndex};
use crate::policy::InvalidationFlag;
use crate::resource::{ResourceKey, VersionTag};
use crate::store::ContentStore;

/// Body of the synthetic 502 returned when the origin is down and nothing is cached.
pub const GATEWAY_FAILURE_BODY: &str =
    "Bad Gateway: the origin server could not be reached and no cached copy of this resource exists.\n";

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Content served, from disk or from the origin.
    Served,
    /// Origin unreachable or forbidding; previously cached bytes served.
    StaleFallback,
    /// Origin answered 304 and nothing was cached.
    NotModifiedPassthrough,
    /// Origin error status passed through.
    ErrorPassthrough,
    /// Origin unreachable and nothing cached.
    GatewayFailure,
}

/// Outcome of a revalidation, shared with coalesced waiters.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    pub contents: Option<Bytes>,
    /// Entry describing `contents`, when the resource is cached or being cached.
    pub entry: Option<CacheEntry>,
    pub disposition: Disposition,
}

/// Shared result type delivered through the coalescer.
pub type SharedOutcome = CacheResult<FetchOutcome>;

/// Headers taken from an origin response.
#[derive(Debug, Clone, Default)]
pub struct OriginHeaders {
    pub last_modified: Option<String>,
    pub cache_control: Option<String>,
    pub content_length: Option<u64>,
}

impl OriginHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            last_modified: headers
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            cache_control: headers
                .get(reqwest::header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            content_length: headers
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// One revalidation job.
#[derive(Debug, Clone)]
pub struct RevalidateRequest {
    pub content_path: PathBuf,
    pub key: ResourceKey,
    pub url: String,
    pub version: VersionTag,
    /// `Last-Modified` of the cached copy; `None` means nothing usable is cached.
    pub last_modified: Option<String>,
    /// Client headers forwarded to the origin.
    pub headers: HeaderMap,
}

/// Everything needed to finish a full refresh in the background.
struct Refresh {
    outcome: FetchOutcome,
    body: Bytes,
    entry: CacheEntry,
}

enum Step {
    Ready(SharedOutcome),
    Refresh(Refresh),
}

/// Executes the conditional-fetch protocol.
#[derive(Debug, Clone)]
pub struct Revalidator {
    client: reqwest::Client,
    store: ContentStore,
    index: Arc<MetadataIndex>,
    flag: InvalidationFlag,
}

impl Revalidator {
    pub fn new(
        config: &EngineConfig,
        store: ContentStore,
        index: Arc<MetadataIndex>,
        flag: InvalidationFlag,
    ) -> CacheResult<Self> {
        let mut default_headers = HeaderMap::new();
        let user_agent =
            HeaderValue::from_str(&config.user_agent).map_err(|e| CacheError::Config {
                message: format!("invalid user agent: {}", e),
            })?;
        default_headers.insert(USER_AGENT, user_agent);

        let mut builder = reqwest::Client::builder().default_headers(default_headers);
        if let Some(secs) = config.origin_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let client = builder.build().map_err(|e| CacheError::Network {
            message: format!("failed to create HTTP client: {}", e),
        })?;

        Ok(Self {
            client,
            store,
            index,
            flag,
        })
    }

    /// Run the protocol for `req` and complete `leader` with the outcome.
    pub async fn run(&self, req: RevalidateRequest, leader: FlightLeader<SharedOutcome>) -> SharedOutcome {
        match self.fetch(&req).await {
            Step::Ready(result) => {
                leader.complete(result.clone());
                result
            }
            Step::Refresh(refresh) => {
                let outcome = refresh.outcome.clone();
                self.spawn_persist(req, refresh, leader);
                Ok(outcome)
            }
        }
    }

    async fn fetch(&self, req: &RevalidateRequest) -> Step {
        let mut request = self.client.get(&req.url).headers(req.headers.clone());
        if let Some(last_modified) = &req.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        debug!(
            key = %req.key,
            url = %req.url,
            conditional = req.last_modified.is_some(),
            "fetching from origin"
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Step::Ready(self.transport_failure(req, &e.to_string()).await),
        };

        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Step::Ready(self.not_modified(req).await);
        }

        if status == StatusCode::FORBIDDEN && req.last_modified.is_some() {
            return Step::Ready(self.stale_fallback(req, "origin answered 403").await);
        }

        if status.as_u16() >= 400 {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(key = %req.key, error = %e, "failed to read error body from origin");
                    Bytes::new()
                }
            };
            info!(key = %req.key, status = status.as_u16(), "passing origin error through");
            return Step::Ready(Ok(FetchOutcome {
                status: status.as_u16(),
                contents: Some(body),
                entry: self.index.get(req.key.as_str()).await,
                disposition: Disposition::ErrorPassthrough,
            }));
        }

        let headers = OriginHeaders::from_headers(response.headers());
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Step::Ready(self.transport_failure(req, &e.to_string()).await),
        };

        let length = headers.content_length.unwrap_or(body.len() as u64);
        // Readers comparing disk size against the index see the new length
        // before the write below lands.
        self.index.set_length(req.key.as_str(), length).await;

        let entry = CacheEntry {
            version: req.version.as_str().to_string(),
            last_modified: headers.last_modified,
            length,
            cache_control: headers.cache_control,
        };

        Step::Refresh(Refresh {
            outcome: FetchOutcome {
                status: status.as_u16(),
                contents: Some(body.clone()),
                entry: Some(entry.clone()),
                disposition: Disposition::Served,
            },
            body,
            entry,
        })
    }

    async fn transport_failure(&self, req: &RevalidateRequest, reason: &str) -> SharedOutcome {
        if req.last_modified.is_some() {
            return self.stale_fallback(req, reason).await;
        }

        warn!(key = %req.key, reason, "origin unreachable and nothing cached");
        Ok(FetchOutcome {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            contents: Some(Bytes::from_static(GATEWAY_FAILURE_BODY.as_bytes())),
            entry: None,
            disposition: Disposition::GatewayFailure,
        })
    }

    async fn stale_fallback(&self, req: &RevalidateRequest, reason: &str) -> SharedOutcome {
        warn!(key = %req.key, reason, "serving stale copy");
        let contents = self.store.read(&req.content_path).await?;
        self.flag.raise();

        Ok(FetchOutcome {
            status: StatusCode::OK.as_u16(),
            contents: Some(contents),
            entry: self.index.get(req.key.as_str()).await,
            disposition: Disposition::StaleFallback,
        })
    }

    async fn not_modified(&self, req: &RevalidateRequest) -> SharedOutcome {
        if req.last_modified.is_none() {
            return Ok(FetchOutcome {
                status: StatusCode::NOT_MODIFIED.as_u16(),
                contents: None,
                entry: None,
                disposition: Disposition::NotModifiedPassthrough,
            });
        }

        let contents = self.store.read(&req.content_path).await?;
        let entry = self
            .index
            .set_version(req.key.as_str(), req.version.as_str())
            .await;
        self.index.queue_save();
        self.flag.mark_clean(&req.key);

        debug!(key = %req.key, version = %req.version, "not modified, version confirmed");
        Ok(FetchOutcome {
            status: StatusCode::OK.as_u16(),
            contents: Some(contents),
            entry,
            disposition: Disposition::Served,
        })
    }

    fn spawn_persist(
        &self,
        req: RevalidateRequest,
        refresh: Refresh,
        leader: FlightLeader<SharedOutcome>,
    ) {
        let store = self.store.clone();
        let index = Arc::clone(&self.index);
        let flag = self.flag.clone();

        tokio::spawn(async move {
            let Refresh {
                outcome,
                body,
                entry,
            } = refresh;

            match store.write_atomic(&req.content_path, &body).await {
                Ok(()) => {
                    index.insert(req.key.as_str(), entry).await;
                    index.queue_save();
                    flag.mark_clean(&req.key);
                    info!(
                        key = %req.key,
                        version = %req.version,
                        bytes = body.len(),
                        "cached"
                    );
                }
                Err(e) => {
                    // Waiters still get the fetched bytes; the next request refetches.
                    warn!(key = %req.key, error = %e, "failed to store fetched content");
                }
            }

            leader.complete(Ok(outcome));
        });
    }
}
