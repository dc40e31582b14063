//! Revalidating disk cache for the revcache asset proxy.
//!
//! Static assets fetched from an origin are mirrored to disk under their URL
//! path and described by a persisted metadata index. A request's query string
//! is its version tag; a request whose tag matches the cached entry (or that
//! carries no tag) is served from disk without contacting the origin.
//!
//! - Content store with atomic writes
//! - Metadata index with debounced, crash-safe persistence
//! - Single-flight coalescing of origin fetches
//! - Conditional revalidation with stale fallback when the origin fails
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use revcache_core::{CacheEngine, EngineConfig, InvalidationFlag, LookupOptions, NameTables};
//!
//! # async fn example() -> revcache_core::CacheResult<()> {
//! let flag = InvalidationFlag::new();
//! let policy = Arc::new(NameTables::new(Vec::new(), Vec::new(), flag.clone()));
//! let engine = CacheEngine::open(EngineConfig::from_env(), policy, flag).await?;
//!
//! let resolved = engine
//!     .lookup("http://203.104.209.7/kcs2/img.png?abc123", &LookupOptions::default())
//!     .await?;
//! println!("{} {:?}", resolved.status, resolved.route);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `REVCACHE_CACHE_ROOT` | Content directory |
//! | `REVCACHE_INDEX_PATH` | Metadata index file (default: `cache.json` next to the content directory) |
//! | `REVCACHE_SAVE_QUIET_MS` | Index save quiet period (default: 5000) |
//! | `REVCACHE_ORIGIN_TIMEOUT` | Origin request timeout in seconds (default: none) |

pub mod config;
pub mod engine;
pub mod error;
pub mod flight;
pub mod index;
pub mod policy;
pub mod resource;
pub mod revalidate;
pub mod store;

// Re-export main types
pub use config::{EngineConfig, ProxyConfig, INDEX_FILE_NAME};
pub use engine::{CacheEngine, LookupOptions, Resolved, Route};
pub use error::{CacheError, CacheResult};
pub use flight::{Flight, SingleFlight};
pub use index::{CacheEntry, MetadataIndex};
pub use policy::{InvalidationFlag, NameTables, ResourcePolicy};
pub use resource::{ResourceKey, ResourceRequest, VersionTag, INDEX_DOCUMENT};
pub use revalidate::{Disposition, FetchOutcome, GATEWAY_FAILURE_BODY};
pub use store::ContentStore;
