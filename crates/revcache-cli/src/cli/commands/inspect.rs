use anyhow::Context;
use revcache_core::{ProxyConfig, ResourceRequest};
use serde_json::json;

use super::open_engine;
use crate::cli::args::InspectArgs;
use crate::exit_codes;

pub async fn run(args: InspectArgs, config: ProxyConfig) -> anyhow::Result<i32> {
    let request = ResourceRequest::parse(&args.url)?;
    let engine = open_engine(&config).await?;

    let Some(entry) = engine.index().get(request.key.as_str()).await else {
        eprintln!("not cached: {}", request.key);
        return Ok(exit_codes::NOT_CACHED);
    };

    let path = engine.store().path_for(&request.key);
    let on_disk = engine.store().len(&path).await;
    let report = json!({
        "key": request.key.as_str(),
        "path": path.display().to_string(),
        "entry": entry,
        "on_disk": on_disk,
        "hit": request.version.accepts(&entry.version)
            && !engine.policy().is_blacklisted(&request.key)
            && !engine.policy().is_invalidated(&request.key)
            && on_disk.is_some(),
    });

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render entry")?
    );
    Ok(exit_codes::SUCCESS)
}
