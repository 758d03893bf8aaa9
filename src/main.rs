//! Binary entry point: set up logging, then hand off to the CLI.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = taskpilot::cli::parse_cli();

    // RUST_LOG wins over --log-level, which in turn defaults to "info".
    let fallback = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback)))
        .init();

    taskpilot::cli::run_with_cli(cli).await
}
