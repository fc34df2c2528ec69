//! mongo-pg-sync CLI - Real-time MongoDB to PostgreSQL synchronization.

use chrono::Utc;
use clap::{Parser, Subcommand};
use mongo_pg_sync::{
    health_check, Config, ConnectionPool, EngineSettings, EngineStatus, MongoSource,
    PassExecutor, PgConnectionManager, Pipeline, PoolSettings, RunOutcome, SyncEngine,
    SyncError, SyncRun, SyncTrigger,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mongo-pg-sync")]
#[command(about = "Real-time MongoDB to PostgreSQL synchronization")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until SIGINT/SIGTERM
    Serve {
        /// Seconds between status log lines
        #[arg(long, default_value = "60")]
        status_interval_secs: u64,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "60")]
        shutdown_timeout: u64,
    },

    /// Run a single sync pass and exit
    RunOnce,

    /// Test database connections
    HealthCheck,

    /// Load and validate the configuration, then print it with secrets masked
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(SyncError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::CheckConfig => {
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            } else {
                println!("Configuration is valid");
                println!("{:#?}", config);
            }
        }

        Commands::HealthCheck => {
            let result = health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MongoDB): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                let failed = match (result.source_connected, result.target_connected) {
                    (false, false) => "source and target unreachable",
                    (false, true) => "source unreachable",
                    _ => "target unreachable",
                };
                return Err(SyncError::Unhealthy(failed.to_string()));
            }
        }

        Commands::RunOnce => {
            let config = config.with_auto_tuning();
            let cancel_token = setup_signal_handler(0)?;
            let run = run_once(&config, cancel_token).await?;

            if cli.output_json {
                println!("{}", run.to_json()?);
            } else {
                print_run(&run);
            }

            match run.outcome {
                Some(RunOutcome::Succeeded) => {}
                Some(RunOutcome::Superseded) => return Err(SyncError::Cancelled),
                Some(RunOutcome::Failed) | None => {
                    return Err(SyncError::PassFailed(
                        run.error.unwrap_or_else(|| "unknown error".to_string()),
                    ))
                }
            }
        }

        Commands::Serve {
            status_interval_secs,
            shutdown_timeout,
        } => {
            let config = config.with_auto_tuning();
            let cancel_token = setup_signal_handler(shutdown_timeout)?;
            let status = serve(
                &config,
                cancel_token,
                Duration::from_secs(status_interval_secs.max(1)),
                Duration::from_secs(shutdown_timeout),
            )
            .await?;

            if cli.output_json {
                println!("{}", status.to_json()?);
            }
        }
    }

    Ok(())
}

/// Start the engine and keep it running until the token fires.
async fn serve(
    config: &Config,
    cancel_token: CancellationToken,
    status_interval: Duration,
    shutdown_timeout: Duration,
) -> Result<EngineStatus, SyncError> {
    let source = Arc::new(MongoSource::connect(&config.source).await?);
    let manager = PgConnectionManager::new(&config.target)?;

    let engine = match SyncEngine::start(
        EngineSettings::from_config(config),
        manager,
        source.clone(),
        source.clone(),
    )
    .await
    {
        Ok(engine) => engine,
        Err(e) => {
            source.shutdown().await;
            return Err(e);
        }
    };

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => log_status(&engine.status()),
        }
    }

    let stopped = tokio::time::timeout(shutdown_timeout, engine.shutdown()).await;
    source.shutdown().await;

    let status = engine.status();
    if stopped.is_err() {
        warn!(
            "Graceful shutdown did not finish within {}s",
            shutdown_timeout.as_secs()
        );
        return Err(SyncError::Cancelled);
    }
    log_status(&status);
    Ok(status)
}

/// One synchronous pass outside the engine.
async fn run_once(config: &Config, cancel_token: CancellationToken) -> Result<SyncRun, SyncError> {
    let source = Arc::new(MongoSource::connect(&config.source).await?);
    let pool = Arc::new(ConnectionPool::new(PoolSettings::from_config(&config.pool)));

    let initialized = match PgConnectionManager::new(&config.target) {
        Ok(manager) => pool.initialize(manager).await,
        Err(e) => Err(e),
    };
    if let Err(e) = initialized {
        source.shutdown().await;
        return Err(e);
    }

    let settings = EngineSettings::from_config(config);
    let pipeline = Pipeline::new(source.clone(), Arc::clone(&pool), settings.retry);
    let run = pipeline
        .run_pass(SyncRun::begin(SyncTrigger::Manual, Utc::now(), 0), cancel_token)
        .await;

    pool.shutdown().await;
    source.shutdown().await;
    Ok(run)
}

fn print_run(run: &SyncRun) {
    let outcome = match run.outcome {
        Some(RunOutcome::Succeeded) => "succeeded",
        Some(RunOutcome::Failed) => "failed",
        Some(RunOutcome::Superseded) => "superseded",
        None => "unfinished",
    };
    println!("\nSync pass {}!", outcome);
    println!("  Run ID: {}", run.id);
    if let Some(duration) = run.duration_seconds() {
        println!("  Duration: {:.2}s", duration);
    }
    for report in &run.entities {
        println!(
            "  {:<10} extracted {:>6}  inserted {:>6}  updated {:>6}  unchanged {:>6}  skipped {:>4}",
            report.entity,
            report.extracted,
            report.counts.inserted,
            report.counts.updated,
            report.counts.unchanged,
            report.skipped
        );
    }
    let totals = run.totals();
    println!(
        "  Rows: {} inserted, {} updated, {} unchanged",
        totals.inserted, totals.updated, totals.unchanged
    );
    if let Some(ref err) = run.error {
        println!("  Error: {}", err);
    }
}

fn log_status(status: &EngineStatus) {
    info!(
        "Engine {:?}: listener {:?}, passes {} ok / {} failed / {} superseded, {} coalesced, pool {}/{} checked out",
        status.state,
        status.listener.state,
        status.orchestrator.passes_succeeded,
        status.orchestrator.passes_failed,
        status.orchestrator.passes_superseded,
        status.orchestrator.coalesced_requests,
        status.pool.checked_out,
        status.pool.max_size
    );
    if let Some(ref err) = status.last_error {
        warn!("Last error: {}", err);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (container shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
                token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    Ok(cancel_token)
}
