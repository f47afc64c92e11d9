use anyhow::Result;
use clap::Parser;
use hackdeck::cli::{run, Cli};
use hackdeck::load_config::configured_log_level;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise LOG_LEVEL or the config file's log_level, then info.
    let default_directive = configured_log_level(cli.config.as_deref())
        .and_then(|level| level.parse::<Directive>().ok())
        .unwrap_or_else(|| LevelFilter::INFO.into());
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
    tracing::info!("CLI startup: tracing initialised, environment loaded");

    let result = run(cli).await;
    match &result {
        Ok(()) => tracing::info!("CLI completed successfully"),
        Err(e) => tracing::error!(error = %e, "CLI exited with error"),
    }
    result
}
