//! pairgate — WhatsApp device linking with durable session capture.
//!
//! Subcommands:
//! - `serve`    — run the HTTP facade (`/pair`, `/qr`, `/health`)
//! - `link`     — link a device interactively from the terminal
//! - `sessions` — inspect and manage stored sessions
//! - `reset`    — drop every stored session
//! - `inspect`  — report what a local credential store contains
//! - `check`    — self-check
//! - `init`     — write a starter config

mod api;
mod commands;
mod init;
mod linker;
mod pair;
mod selfcheck;

use clap::{Parser, Subcommand};
use linker::Linker;
use pairgate_channels::BridgeSocketFactory;
use pairgate_core::config::Config;
use pairgate_core::link::SessionStatus;
use pairgate_core::shellexpand;
use pairgate_memory::{AuditLogger, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "pairgate",
    version,
    about = "Link WhatsApp devices by pairing code or QR and persist their sessions"
)]
struct Cli {
    /// Path to config file.
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve {
        /// Listen port (overrides api.port).
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        /// SQLite database, as a path or `sqlite:` URL (overrides memory.db_path).
        #[arg(long = "db", env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Link a device from the terminal.
    Link {
        /// Phone number for pairing-code mode. Omit to link by QR.
        #[arg(long)]
        number: Option<String>,
    },
    /// Manage stored sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Delete every stored session, version, and audit row.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Report the contents of a local credential store directory.
    Inspect { dir: PathBuf },
    /// Verify the database, bridge, and store directory.
    Check,
    /// Interactive setup wizard.
    Init,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List sessions, newest first.
    List {
        /// Only sessions with this status (active, inactive, expired).
        #[arg(long)]
        status: Option<SessionStatus>,
    },
    /// Show one session and its version history.
    Show {
        key: String,
        /// Include the stored credentials document.
        #[arg(long)]
        credentials: bool,
    },
    /// Delete a session and its history.
    Delete { key: String },
    /// Mark a session inactive.
    Deactivate { key: String },
    /// Mark a session active again.
    Activate { key: String },
    /// Write a session's credential files to a directory.
    Export {
        key: String,
        dir: PathBuf,
        /// Export this history version instead of the current record.
        #[arg(long)]
        version: Option<i64>,
    },
    /// Totals and recent link attempts.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The wizard must run even when the existing config is broken.
    let mut config = if matches!(cli.command, Commands::Init) {
        Config::default()
    } else {
        Config::load(&cli.config)?
    };
    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    let _log_guard = init_tracing(&config.data_dir, default_level)?;

    match cli.command {
        Commands::Serve { port, database_url } => {
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(url) = database_url {
                config.memory.db_path = db_path_from_url(&url);
            }
            serve(config).await?;
        }
        Commands::Link { number } => {
            let store = Store::new(&config.memory).await?;
            let linker = build_linker(&config, store);
            pair::link_device(&linker, number).await?;
        }
        Commands::Sessions { action } => {
            let store = Store::new(&config.memory).await?;
            let output = match action {
                SessionsAction::List { status } => commands::list(&store, status).await?,
                SessionsAction::Show { key, credentials } => {
                    commands::show(&store, &key, credentials).await?
                }
                SessionsAction::Delete { key } => commands::delete(&store, &key).await?,
                SessionsAction::Deactivate { key } => {
                    commands::set_status(&store, &key, SessionStatus::Inactive).await?
                }
                SessionsAction::Activate { key } => {
                    commands::set_status(&store, &key, SessionStatus::Active).await?
                }
                SessionsAction::Export { key, dir, version } => {
                    commands::export(&store, &key, version, &dir).await?
                }
                SessionsAction::Status => {
                    let audit = AuditLogger::new(store.pool().clone());
                    commands::status(&store, &audit).await
                }
            };
            println!("{output}");
        }
        Commands::Reset { yes } => {
            let confirmed = yes
                || cliclack::confirm("Delete every stored session? This cannot be undone.")
                    .initial_value(false)
                    .interact()?;
            if confirmed {
                let store = Store::new(&config.memory).await?;
                println!("{}", commands::reset(&store).await?);
            } else {
                println!("Nothing changed.");
            }
        }
        Commands::Inspect { dir } => {
            println!("{}", commands::inspect(&dir).await?);
        }
        Commands::Check => {
            let store = Store::new(&config.memory).await?;
            if !selfcheck::run(&config, &store).await {
                anyhow::bail!("self-check failed");
            }
        }
        Commands::Init => init::run(&cli.config)?,
    }

    Ok(())
}

/// Run the HTTP facade, the expiry sweep, and attempt cleanup until Ctrl-C.
async fn serve(config: Config) -> anyhow::Result<()> {
    let uptime = Instant::now();
    let store = Store::new(&config.memory).await?;
    let linker = build_linker(&config, store.clone());
    linker.clear_leftovers().await;
    info!("pairgate starting with {} bridge", linker.factory_name());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(linker::sweeper::sweep_loop(
        store,
        config.memory.clone(),
        shutdown_rx,
    ));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    let served = api::serve(&config.api, linker.clone(), uptime, shutdown).await;

    let _ = shutdown_tx.send(true);
    linker.shutdown().await;
    let _ = sweep.await;
    info!("pairgate stopped");
    served
}

fn build_linker(config: &Config, store: Store) -> Linker {
    let factory = Arc::new(BridgeSocketFactory::new(&config.bridge));
    Linker::new(factory, store, config.link.clone(), config.memory.clone())
}

/// Accept `sqlite:` URLs as well as bare paths.
fn db_path_from_url(url: &str) -> String {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    path.split('?').next().unwrap_or(path).to_string()
}

/// Stdout (or stderr for CLI commands) plus a daily rolling file under `{data_dir}/logs`.
fn init_tracing(
    data_dir: &str,
    default_level: &str,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = PathBuf::from(shellexpand(data_dir)).join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "pairgate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = if default_level == "info" {
        fmt::layer().with_target(false).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}
