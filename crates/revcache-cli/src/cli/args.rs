use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "revcache",
    version,
    about = "Revalidating caching proxy for static game assets"
)]
pub struct Cli {
    /// YAML config file
    #[arg(long, global = true, env = "REVCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the content directory
    #[arg(long, global = true)]
    pub cache_root: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the caching proxy
    Serve(ServeArgs),
    /// Fetch URLs into the cache without serving them
    Prime(PrimeArgs),
    /// Print the cached entry for a URL as JSON
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen address, e.g. 127.0.0.1:8081
    #[arg(long)]
    pub listen: Option<String>,

    /// Origin base URL for origin-form requests
    #[arg(long)]
    pub origin: Option<String>,

    /// Seconds to wait for in-flight writes on shutdown
    #[arg(long, default_value_t = 10)]
    pub drain_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PrimeArgs {
    /// Origin URLs to fetch, e.g. http://203.104.209.7/kcs2/js/main.js?5.1.2.0
    #[arg(required = true)]
    pub urls: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Origin URL whose entry to show
    pub url: String,
}
