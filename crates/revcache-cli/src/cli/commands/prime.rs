use std::time::Duration;

use revcache_core::ProxyConfig;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::open_engine;
use crate::cli::args::PrimeArgs;
use crate::exit_codes;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(args: PrimeArgs, config: ProxyConfig) -> anyhow::Result<i32> {
    let engine = open_engine(&config).await?;

    let mut tasks = JoinSet::new();
    for url in args.urls {
        let engine = engine.clone();
        tasks.spawn(async move {
            let result = engine.prime(&url).await;
            (url, result)
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let (url, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "priming task failed");
                failed += 1;
                continue;
            }
        };
        match result {
            Ok(Some(resolved)) if resolved.status < 400 => {
                info!(url = %url, status = resolved.status, route = ?resolved.route, "primed");
            }
            Ok(Some(resolved)) => {
                warn!(url = %url, status = resolved.status, "origin refused");
                failed += 1;
            }
            Ok(None) => info!(url = %url, "nothing to cache"),
            Err(e) => {
                warn!(url = %url, error = %e, "priming failed");
                failed += 1;
            }
        }
    }

    engine.shutdown(DRAIN_TIMEOUT).await?;

    if failed > 0 {
        eprintln!("{} url(s) could not be primed", failed);
        return Ok(exit_codes::ORIGIN_ERROR);
    }
    Ok(exit_codes::SUCCESS)
}
