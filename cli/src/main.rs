// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;
use tracing_subscriber::EnvFilter;

async fn run() -> Result<()> {
    let cli = configd_lib::cli::parse_cli(std::env::args());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.filter_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::trace!("starting");
    configd_lib::cli::dispatch(cli).await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
