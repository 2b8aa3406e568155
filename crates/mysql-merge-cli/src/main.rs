//! mysql-merge CLI - merge MySQL databases sharing one schema.

use clap::{Parser, Subcommand};
use mysql_merge::{Config, ExecutionMode, MergeError, MergeResult, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-merge")]
#[command(about = "Merge MySQL databases sharing one schema into a single destination")]
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

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every source into the destination
    Run {
        /// Dry run: statements that would change data are explained, not executed
        #[arg(long, conflicts_with = "import_file")]
        dry_run: bool,

        /// Write the copied rows into patch scripts instead of the destination
        #[arg(long)]
        import_file: bool,
    },

    /// Replay a patch script against the destination
    ApplyPatch {
        /// Patch script written by `run --import-file`
        file: PathBuf,
    },

    /// Test database connections
    HealthCheck,

    /// Load and validate the configuration file
    Validate,
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

async fn run() -> Result<(), MergeError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            dry_run,
            import_file,
        } => {
            let mode = if dry_run {
                ExecutionMode::DryRun
            } else if import_file {
                ExecutionMode::ImportFile
            } else {
                ExecutionMode::Default
            };

            // SIGINT and SIGTERM stop the run between sources
            let cancel_token = setup_signal_handler();

            let orchestrator = Orchestrator::new(config).with_mode(mode);
            let result = orchestrator.run(cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }
            result.into_outcome()?;
        }

        Commands::ApplyPatch { file } => {
            let orchestrator = Orchestrator::new(config);
            let stats = orchestrator.apply_patch(&file).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("\nPatch applied!");
                println!("  File: {}", file.display());
                println!("  Statements: {}", stats.statements);
                println!("  Commits: {}", stats.commits);
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config);
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for db in &result.databases {
                    println!(
                        "  {} ({}): {} ({}ms)",
                        db.role,
                        db.database,
                        if db.connected { "OK" } else { "FAILED" },
                        db.latency_ms
                    );
                    if let Some(ref err) = db.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MergeError::Config("Health check failed".to_string()));
            }
        }

        Commands::Validate => {
            if cli.output_json {
                println!(
                    "{}",
                    serde_json::json!({
                        "valid": true,
                        "destination": config.destination.database,
                        "sources": config.sources.iter().map(|s| &s.database).collect::<Vec<_>>(),
                        "config_hash": config.hash(),
                    })
                );
            } else {
                println!("Configuration is valid");
                println!("  Destination: {}", config.destination.database);
                for (i, source) in config.sources.iter().enumerate() {
                    println!("  Source #{}: {}", i + 1, source.database);
                }
            }
        }
    }

    Ok(())
}

fn print_result(result: &MergeResult) {
    let status_msg = match result.status.as_str() {
        "dry_run" => "Dry run completed!",
        "cancelled" => "Merge cancelled!",
        _ => "Merge completed!",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    for db in &result.databases {
        println!(
            "  {} (#{}): {} tables, {} rows",
            db.database, db.counter, db.copy.tables_copied, db.copy.rows
        );
        if !db.copy.tables_skipped.is_empty() {
            println!("    Skipped tables: {:?}", db.copy.tables_skipped);
        }
        if !db.reference_tables.is_empty() {
            println!("    Reference tables: {:?}", db.reference_tables);
        }
        if db.conflicts_resolved > 0 {
            println!("    Unique conflicts resolved: {}", db.conflicts_resolved);
        }
        if let Some(ref patch) = db.patch_file {
            println!("    Patch script: {}", patch);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    eprintln!(
                        "\nReceived {}. Finishing the current source, then stopping...",
                        name
                    );
                    token.cancel();
                }
                Err(e) => eprintln!("Failed to setup {} handler: {}", name, e),
            }
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Finishing the current source, then stopping...");
                token.cancel();
            }
            Err(e) => eprintln!("Failed to setup Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
