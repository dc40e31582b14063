//! Caching reverse proxy binary support: CLI, HTTP listener and logging.
//!
//! The `revcache` binary puts [`revcache_core::CacheEngine`] behind a plain
//! HTTP/1 listener. Point a browser (or its proxy setting) at it and asset
//! requests are answered from the local mirror whenever the requested version
//! is already cached.

pub mod cli;
pub mod exit_codes;
pub mod logging;
pub mod proxy;
