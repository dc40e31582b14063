use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use revcache_core::{CacheEngine, InvalidationFlag, NameTables, ProxyConfig};

use super::args::{Cli, Command};

pub mod inspect;
pub mod prime;
pub mod serve;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(root) = cli.cache_root {
        config.engine.cache_root = root;
    }

    match cli.cmd {
        Command::Serve(args) => serve::run(args, config).await,
        Command::Prime(args) => prime::run(args, config).await,
        Command::Inspect(args) => inspect::run(args, config).await,
    }
}

/// Config file (if any), then `REVCACHE_*` environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ProxyConfig> {
    match path {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(ProxyConfig::from_env()),
    }
}

/// Build the name tables and open the engine described by `config`.
pub async fn open_engine(config: &ProxyConfig) -> anyhow::Result<Arc<CacheEngine>> {
    let flag = InvalidationFlag::new();
    let policy = Arc::new(NameTables::new(
        config.blacklist.iter().cloned(),
        config.manifests.iter().cloned(),
        flag.clone(),
    ));
    let engine = CacheEngine::open(config.engine.clone(), policy, flag)
        .await
        .context("failed to open cache")?;
    Ok(Arc::new(engine))
}
