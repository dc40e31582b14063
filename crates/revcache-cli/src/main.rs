use clap::Parser;

use revcache_cli::cli::args::Cli;
use revcache_cli::cli::commands::dispatch;
use revcache_cli::{exit_codes, logging};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            exit_codes::for_error(&e)
        }
    };
    std::process::exit(code);
}
