use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use revcache_core::{CacheError, ProxyConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::open_engine;
use crate::cli::args::ServeArgs;
use crate::exit_codes;
use crate::proxy::{self, ProxyState};

pub async fn run(args: ServeArgs, mut config: ProxyConfig) -> anyhow::Result<i32> {
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(origin) = args.origin {
        config.origin = Some(origin);
    }
    if let Some(origin) = &config.origin {
        validate_origin(origin)?;
    }

    let engine = open_engine(&config).await?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let local_addr = listener.local_addr()?;

    info!(
        addr = %local_addr,
        origin = config.origin.as_deref().unwrap_or("<from request>"),
        cache_root = %config.engine.cache_root.display(),
        entries = engine.index().len().await,
        "revcache starting"
    );

    let state = Arc::new(ProxyState::new(engine.clone(), config.origin.clone(), local_addr));
    proxy::serve(listener, state, shutdown_signal()).await?;

    engine
        .shutdown(Duration::from_secs(args.drain_secs))
        .await?;
    Ok(exit_codes::SUCCESS)
}

fn validate_origin(origin: &str) -> Result<(), CacheError> {
    let url = url::Url::parse(origin).map_err(|e| CacheError::Config {
        message: format!("invalid origin {}: {}", origin, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(CacheError::Config {
            message: format!("origin must be an http(s) URL with a host: {}", origin),
        });
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the proxy runs until killed.
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
