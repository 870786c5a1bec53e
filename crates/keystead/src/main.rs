#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

mod chains;
mod config;
mod doctor;
mod errors;
mod fsutil;
mod keystore;
mod lifecycle;
mod network;
mod paths;
mod retry;
mod rpc;
mod service;
mod signing;
mod store;
#[cfg(test)]
mod testkit;
mod wallet;

use clap::{Parser, Subcommand};
use eyre::Context as _;
use std::io::Write as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

#[derive(Parser, Debug)]
#[command(name = "keystead", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve line-delimited JSON over stdin/stdout.
    ///
    /// Lines typed `WEB3_WALLET_REQUEST` are page requests; every other line
    /// is a trusted wallet-UI message.
    Serve {
        /// Keep wallet state in memory only (nothing is written under the data dir).
        #[arg(long, default_value_t = false)]
        ephemeral: bool,
    },

    /// Run the long-lived local socket server.
    ///
    /// Peers reach only the page surface until they send
    /// `{"type":"AUTHENTICATE","token":...}` with the token stored next to the socket.
    Daemon {
        /// Exit after this many seconds with no connected clients.
        #[arg(long)]
        idle_exit_seconds: Option<u64>,
    },

    /// Report paths, config health and wallet flags. Never prints secrets.
    Doctor {
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print resolved config/data paths as JSON.
    Paths,

    /// Print the configured network table as JSON.
    Networks,
}

fn init_logging(paths: &paths::KeysteadPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("keystead.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn print_json(v: &serde_json::Value, what: &str) -> eyre::Result<()> {
    let s = serde_json::to_string(v).with_context(|| format!("serialize {what}"))?;
    writeln!(std::io::stdout().lock(), "{s}").with_context(|| format!("write {what}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::KeysteadPaths::discover()?;
    paths.ensure_private_dirs().context("create private dirs")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Serve { ephemeral } => rpc::server::run_stdio(&paths, ephemeral)
            .await
            .context("serve failed"),
        Command::Daemon { idle_exit_seconds } => rpc::server::run_daemon(&paths, idle_exit_seconds)
            .await
            .context("daemon failed"),
        Command::Doctor { json } => doctor::run(&paths, json).await.context("doctor failed"),
        Command::Paths => print_json(
            &serde_json::json!({
              "config_dir": paths.config_dir,
              "data_dir": paths.data_dir,
              "log_file": paths.log_file,
              "socket": paths.socket_path(),
            }),
            "paths",
        ),
        Command::Networks => {
            let cfg = config::ConfigStore::new(&paths).load_or_init_default()?;
            let table = cfg
                .networks
                .iter()
                .map(network::Network::from_entry)
                .collect::<eyre::Result<Vec<_>>>()?;
            print_json(
                &serde_json::json!({ "default": cfg.default_network, "networks": table }),
                "networks",
            )
        }
    }
}
