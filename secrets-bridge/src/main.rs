//! secrets-bridge - main entry point
//!
//! `serve` starts a bridge server; `print`, `exec`, `test` and `kill` are
//! clients of a running one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use secrets_bridge::config::{ClientArgs, ExecArgs, ServeArgs, ServeConfig};
use secrets_bridge::exec::{self, ExecOutcome, ExecRequest};
use secrets_bridge::lifecycle;
use secrets_bridge::{BridgeClient, BridgeServer};

/// Ephemeral mutual-TLS bridge for secrets and SSH agent access
#[derive(Parser)]
#[command(name = "secrets-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bridge server
    Serve(ServeArgs),

    /// Write one secret to stdout
    Print {
        #[command(flatten)]
        client: ClientArgs,

        /// Secret name, optionally with an encoding prefix
        key: String,
    },

    /// Run a command with secrets in its environment
    Exec {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Check that a bridge server answers
    #[command(visible_alias = "ping")]
    Test {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Ask a bridge server to exit
    Kill {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Every connection in this process uses aws-lc-rs.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let filter = log_filter(cli.verbose);

    match cli.command {
        Commands::Serve(args) => {
            let config = args.resolve().context("Invalid serve configuration")?;
            serve(config, filter).await
        }
        Commands::Print { client, key } => {
            init_cli_logging(filter);
            print_secret(&client, &key).await
        }
        Commands::Exec { client, exec } => {
            init_cli_logging(filter);
            let request = exec.request().context("Invalid exec arguments")?;
            exec_command(&client, request).await
        }
        Commands::Test { client } => {
            init_cli_logging(filter);
            test_connection(&client).await
        }
        Commands::Kill { client } => {
            init_cli_logging(filter);
            kill(&client).await
        }
    }
}

/// Default level plus quiet transport crates; RUST_LOG layers on top.
fn log_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    let base = "hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,tungstenite=warn,tokio_tungstenite=warn";
    match std::env::var("RUST_LOG") {
        Ok(env) => EnvFilter::new(format!("{base},{level},{env}")),
        Err(_) => EnvFilter::new(format!("{base},{level}")),
    }
}

/// Initialize logging for client commands (stderr; stdout carries secrets).
fn init_cli_logging(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

/// Initialize logging for the server: the daemon log file when detached,
/// stderr otherwise. Both go through a non-blocking writer.
fn init_server_logging(filter: EnvFilter, log_file: Option<&Path>) -> Result<WorkerGuard> {
    let detached = match log_file {
        Some(path) if lifecycle::is_daemon_child() => Some(path),
        _ => None,
    };

    let (writer, guard) = match detached {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(detached.is_some())
                .with_ansi(detached.is_none())
                .with_writer(writer),
        )
        .init();

    if let Some(path) = detached {
        info!("Logging to: {}", path.display());
    }
    Ok(guard)
}

/// Run the bridge server, or launch it in the background and wait for readiness.
async fn serve(config: ServeConfig, filter: EnvFilter) -> Result<ExitCode> {
    if let Some(log_file) = &config.daemonize {
        if !lifecycle::is_daemon_child() {
            init_cli_logging(filter);
            lifecycle::launch_daemon(&config, log_file)
                .await
                .context("Failed to start background server")?;
            return Ok(ExitCode::SUCCESS);
        }
    }

    let _guard = init_server_logging(filter, config.daemonize.as_deref())?;

    let server = BridgeServer::bind(&config)
        .await
        .context("Failed to start bridge server")?;

    if !config.write_conf {
        let encoded = server.descriptor().encode()?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{encoded}")?;
        stdout.flush()?;
    }

    lifecycle::notify_parent_ready().context("Failed to signal readiness")?;

    let reason = server.serve().await.context("Bridge server failed")?;
    info!(?reason, "Bridge server stopped");
    Ok(ExitCode::from(reason.exit_code()))
}

async fn connect(args: &ClientArgs) -> Result<BridgeClient> {
    let descriptor = args
        .descriptor()
        .context("Failed to load bridge descriptor")?;
    BridgeClient::connect(&descriptor, &args.options())
        .await
        .context("Failed to reach bridge server")
}

async fn print_secret(args: &ClientArgs, key: &str) -> Result<ExitCode> {
    let client = connect(args).await?;
    let secret = client
        .get_secret(key)
        .await
        .with_context(|| format!("Failed to fetch secret {key:?}"))?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&secret)?;
    stdout.flush()?;
    Ok(ExitCode::SUCCESS)
}

async fn exec_command(args: &ClientArgs, request: ExecRequest) -> Result<ExitCode> {
    let client = Arc::new(connect(args).await?);
    let outcome = exec::run(client, request).await?;
    match &outcome {
        ExecOutcome::FailedToStart(e) => error!("Failed to start command: {}", e),
        ExecOutcome::Exited(status) if !status.success() => debug!(%status, "Command failed"),
        ExecOutcome::Exited(_) => {}
    }
    Ok(ExitCode::from(outcome.exit_code()))
}

async fn test_connection(args: &ClientArgs) -> Result<ExitCode> {
    let client = connect(args).await?;
    client.ping().await.context("Bridge server did not answer")?;
    println!("bridge server responding");
    Ok(ExitCode::SUCCESS)
}

async fn kill(args: &ClientArgs) -> Result<ExitCode> {
    let client = connect(args).await?;
    let ack = client.quit().await.context("Failed to stop bridge server")?;
    debug!(ack = %ack.trim(), "Server acknowledged quit");
    println!("bridge server terminated");
    Ok(ExitCode::SUCCESS)
}
