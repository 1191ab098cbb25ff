mod config;
mod decoder;
mod docker;
mod engine;
mod evaluator;
mod executor;
mod process;
mod timing;
mod validator;


use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Backend, GraderConfig};
use engine::RuntimeProvider;
use evaluator::ComparisonPolicy;
use executor::Grader;
use gauntlet_common::types::Submission;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "gauntlet-worker")]
#[command(about = "Gauntlet - grade a submitted function against ordered test cases", long_about = None)]
struct Cli {
    /// Grader configuration file (defaults to config/gauntlet.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a submission and print the run report as JSON
    Grade {
        /// Identifier of the submitting principal
        #[arg(short, long)]
        submitter: String,

        /// File holding the submitted source ("-" for stdin)
        #[arg(long)]
        source: PathBuf,

        /// File holding the serialized test-case payload
        #[arg(long)]
        tests: PathBuf,

        /// Override the configured backend (docker, process)
        #[arg(short, long)]
        backend: Option<Backend>,
    },

    /// Validate a submission and show the function that would be graded
    Check {
        #[arg(long)]
        source: PathBuf,
    },

    /// Remove leftover sandbox containers
    Sweep {
        /// Only remove containers created for this submitter
        #[arg(short, long)]
        submitter: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn build_provider(config: &GraderConfig) -> Result<Arc<dyn RuntimeProvider>> {
    Ok(match config.backend {
        Backend::Docker => Arc::new(docker::DockerProvider::connect(
            &config.image,
            &config.python_bin,
            config.limits.clone(),
        )?),
        Backend::Process => {
            let provider = process::ProcessProvider::new(&config.python_bin, config.limits.clone());
            match &config.work_dir {
                Some(dir) => Arc::new(provider.with_root(dir.clone())),
                None => Arc::new(provider),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = GraderConfig::load_or_default(cli.config.as_deref())
        .and_then(GraderConfig::apply_env)
        .map_err(|e| {
            error!("Failed to load grader configuration: {:#}", e);
            e
        })?;

    match cli.command {
        Commands::Grade {
            submitter,
            source,
            tests,
            backend,
        } => {
            if let Some(backend) = backend {
                config.backend = backend;
            }
            let submission = Submission::new(submitter, read_input(&source)?);
            let payload = read_input(&tests)?;

            info!(
                backend = %config.backend,
                timeout_ms = config.limits.timeout_ms,
                memory_mb = config.limits.memory_limit_mb,
                "Gauntlet worker booting"
            );

            let grader = Grader::new(
                build_provider(&config)?,
                config.limits.max_source_bytes,
                ComparisonPolicy {
                    float_tolerance: config.float_tolerance,
                },
            );

            // Ctrl-C stops grading; run_until still releases the sandbox before returning
            let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
            let watcher = tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Received shutdown signal, cancelling run");
                    let _ = shutdown_tx.send(true);
                }
            });
            let cancelled = async move {
                if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };

            let report = grader.run_until(&submission, &payload, cancelled).await;
            watcher.abort();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Check { source } => {
            let source = read_input(&source)?;
            match validator::prepare(&source, config.limits.max_source_bytes) {
                Ok(program) => {
                    println!("{}({})", program.entry.name, program.entry.params.join(", "));
                }
                Err(rejection) => {
                    println!("{}: {}", rejection.kind(), rejection);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sweep { submitter } => {
            let docker = bollard::Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?;
            let removed = docker::sweep(&docker, submitter.as_deref()).await?;
            info!(removed, "Sweep complete");
        }
    }

    Ok(())
}
