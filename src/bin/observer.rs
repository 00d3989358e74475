//! oc-memory daemon
//!
//! Watches conversation directories, extracts observations into the Active
//! Document and manages the Hot/Warm/Cold lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oc_memory::config::LoggingConfig;
use oc_memory::daemon::StatusReport;
use oc_memory::{Collaborators, Config, DirectoryWatcher, Orchestrator};

#[derive(Parser)]
#[command(name = "oc-memory", version, about = "Tiered memory lifecycle daemon")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml", env = "OC_MEMORY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default)
    Run,
    /// Compress files once; defaults to the Active Document
    Compress {
        #[arg(long = "target", num_args = 1..)]
        targets: Vec<PathBuf>,
        /// Desired size as a fraction of the original
        #[arg(long, default_value_t = 0.5)]
        compression_target: f64,
    },
    /// Run one Hot to Warm migration pass
    Archive,
    /// Print token usage and tier counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config.logging)?;
    info!("oc-memory v{}", env!("CARGO_PKG_VERSION"));

    let collaborators = Collaborators::from_config(&config).await;
    let orchestrator = Arc::new(Orchestrator::new(&config, collaborators)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, orchestrator).await,
        Command::Compress {
            targets,
            compression_target,
        } => compress(&config, &orchestrator, targets, compression_target).await,
        Command::Archive => {
            let report = orchestrator.ttl().check_and_archive()?;
            println!(
                "Archived {} item(s): {} file(s), {} observation line(s), {} failed",
                report.hot_to_warm, report.files, report.lines, report.failed
            );
            Ok(())
        }
        Command::Stats => {
            print_stats(&orchestrator.status()?);
            Ok(())
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)?,
    };
    let (plain, json) = if logging.json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
    Ok(())
}

async fn run(config: Config, orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(256);

    let mut watcher =
        DirectoryWatcher::from_config(&config.watch).exclude(config.memory.dir.clone());
    if let Some(vault) = &config.vault.path {
        watcher = watcher.exclude(vault.clone());
    }
    let watcher = watcher.spawn(events_tx, shutdown_rx.clone());

    if let Some(port) = config.status.port {
        let app = status_router(orchestrator.clone());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        info!("status endpoint on http://127.0.0.1:{}", port);

        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "status endpoint failed");
            }
        });
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(events_rx, shutdown_rx).await?;
    watcher.await?;
    Ok(())
}

async fn compress(
    config: &Config,
    orchestrator: &Orchestrator,
    targets: Vec<PathBuf>,
    compression_target: f64,
) -> anyhow::Result<()> {
    if orchestrator.reflector().is_none() {
        anyhow::bail!(
            "compression needs an LLM; set {} or enable the llm section",
            config.llm.api_key_env
        );
    }

    // make sure the Active Document exists before compressing anything
    orchestrator.merger().flush()?;
    let targets = if targets.is_empty() {
        vec![config.active_document_path()]
    } else {
        targets
    };

    for target in targets {
        match orchestrator.compress_file(&target, compression_target).await {
            Ok(Some(record)) if record.is_effective() => println!(
                "{}: {} -> {} tokens (ratio {:.2})",
                target.display(),
                record.original_tokens,
                record.compressed_tokens,
                record.compression_ratio
            ),
            Ok(Some(_)) => println!("{}: not compressed, kept original", target.display()),
            Ok(None) => println!("{}: empty, skipped", target.display()),
            Err(e) => eprintln!("{}: {}", target.display(), e),
        }
    }
    Ok(())
}

fn print_stats(status: &StatusReport) {
    println!("Active Document: {} tokens", status.tokens);
    if status.max_tokens > 0 {
        println!("Token budget:    {}", status.max_tokens);
    }
    if let Some(level) = status.suggested_level {
        println!("Suggested level: {}", level);
    }
    println!("Observations:    {}", status.tiers.active_observations);
    println!("Hot files:       {}", status.tiers.hot_files);
    println!("Warm files:      {}", status.tiers.warm_files);
}

fn status_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<Json<StatusReport>, StatusCode> {
    orchestrator.status().map(Json).map_err(|e| {
        warn!(error = %e, "failed to collect status");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
