//! Command-line interface for hackdeck.
//!
//! Argument parsing and wiring only: the pipeline itself lives in [`hackdeck_core`].
//! [`run`] is the async entrypoint shared by `main` and the integration tests.
//!
//! ## Commands
//! - `generate <url>`: run one job synchronously and print the artifact as JSON
//! - `serve`: start the HTTP API (see [`crate::server`])
//! - `reap`: delete leftover repository snapshots older than a threshold

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hackdeck_core::config::{
    ExportFormat, GenerationRequest, JobParameters, PipelineSettings, Tone, Verbosity,
};
use hackdeck_core::contract::SystemClock;
use hackdeck_core::deck::PresentonClient;
use hackdeck_core::download::{reap_stale_snapshots, FetchSettings, GitFetcher, RepositoryUrl};
use hackdeck_core::error::PipelineError;
use hackdeck_core::jobs::JobManager;
use hackdeck_core::llm::select_language_model;
use hackdeck_core::pipeline::Coordinator;

use crate::load_config::{load_config, AppConfig};
use crate::server;

/// Turn a public code repository into a presentation deck.
#[derive(Parser)]
#[clap(
    name = "hackdeck",
    version,
    about = "Clone a repository, summarise it with an LLM and render a slide deck"
)]
pub struct Cli {
    /// Optional YAML settings file; environment variables override it
    #[clap(long, global = true, env = "HACKDECK_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a deck for one repository and print the artifact as JSON
    Generate {
        /// Repository URL, e.g. https://github.com/org/repo
        url: String,
        /// Number of content slides (5 to 15)
        #[clap(long)]
        slides: Option<u32>,
        /// default, casual, professional, funny, educational or sales_pitch
        #[clap(long)]
        tone: Option<Tone>,
        /// concise, standard or text-heavy
        #[clap(long)]
        verbosity: Option<Verbosity>,
        /// Deck template identifier
        #[clap(long)]
        template: Option<String>,
        #[clap(long)]
        language: Option<String>,
        /// pptx or pdf
        #[clap(long)]
        export_as: Option<ExportFormat>,
        /// Skip the title slide
        #[clap(long)]
        no_title_slide: bool,
        /// Add a table-of-contents slide
        #[clap(long)]
        table_of_contents: bool,
    },
    /// Serve the HTTP API
    Serve {
        #[clap(long, default_value = "0.0.0.0", env = "HOST")]
        host: IpAddr,
        #[clap(long, default_value_t = 8000, env = "PORT")]
        port: u16,
    },
    /// Remove leftover repository snapshots from the temporary directory
    Reap {
        /// Only remove snapshots older than this many hours
        #[clap(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

/// Async CLI entrypoint for `main` and integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let config = load_config(cli.config.as_deref())?;
    config.settings.trace_loaded();

    match cli.command {
        Commands::Generate {
            url,
            slides,
            tone,
            verbosity,
            template,
            language,
            export_as,
            no_title_slide,
            table_of_contents,
        } => {
            let request = GenerationRequest {
                repo_url: url,
                slide_count: slides,
                tone,
                verbosity,
                template,
                language,
                export_as,
                include_title_slide: no_title_slide.then_some(false),
                include_table_of_contents: table_of_contents.then_some(true),
            };
            tracing::info!(command = "generate", repo_url = %request.repo_url, "Starting generation");
            // Reject bad input before any credentials are required.
            validate_request(&request, &config.settings).map_err(describe)?;

            let coordinator = build_coordinator(&config)?;
            match coordinator.generate(&request).await {
                Ok(artifact) => {
                    tracing::info!(command = "generate", download_url = %artifact.download_url, "Generation complete");
                    println!("{}", serde_json::to_string_pretty(&artifact)?);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "generate", kind = %e.kind(), error = %e, "Generation failed");
                    Err(describe(e))
                }
            }
        }
        Commands::Serve { host, port } => {
            let coordinator = build_coordinator(&config)?;
            let jobs = Arc::new(JobManager::new(Arc::new(coordinator)));
            tracing::info!(command = "serve", %host, port, "Starting HTTP API");
            server::serve(jobs, SocketAddr::new(host, port)).await
        }
        Commands::Reap { older_than_hours } => {
            let dir = &config.settings.temp_repo_dir;
            let max_age = Duration::from_secs(older_than_hours.saturating_mul(3600));
            let removed = reap_stale_snapshots(dir, max_age)
                .with_context(|| format!("Failed to reap snapshots in {}", dir.display()))?;
            tracing::info!(command = "reap", removed, dir = %dir.display(), "Reaped stale snapshots");
            println!("{removed}");
            Ok(())
        }
    }
}

fn validate_request(
    request: &GenerationRequest,
    settings: &PipelineSettings,
) -> hackdeck_core::error::Result<()> {
    RepositoryUrl::parse_with(
        &request.repo_url,
        &settings.allowed_schemes,
        &settings.allowed_hosts,
    )?;
    JobParameters::resolve(request, settings)?;
    Ok(())
}

fn describe(e: PipelineError) -> anyhow::Error {
    anyhow!("{}: {e}", e.kind())
}

/// Wire the real services: `git`, the configured LLM provider and Presenton.
pub fn build_coordinator(config: &AppConfig) -> Result<Coordinator> {
    let settings = &config.settings;
    let fetcher = GitFetcher::new(FetchSettings::from(settings));
    let model = select_language_model(&config.credentials.providers, &settings.llm)
        .map_err(describe)?;
    let deck = PresentonClient::new(&settings.deck, config.credentials.presenton_api_key.clone())
        .map_err(describe)?;
    Coordinator::new(
        settings.clone(),
        Arc::new(fetcher),
        model,
        Arc::new(deck),
        Arc::new(SystemClock),
    )
    .map_err(describe)
}
