use crate::{
    config::KeysteadConfig,
    paths::KeysteadPaths,
    store::{self, FileKvStore, KvStore as _, StateKey},
};
use eyre::Context as _;
use serde_json::json;
use std::{fs, path::Path, path::PathBuf};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(not(unix))]
use tokio::net::TcpStream;

#[cfg(unix)]
fn daemon_transport_label(paths: &KeysteadPaths) -> (String, String) {
    (
        "unix_socket".to_owned(),
        paths.socket_path().to_string_lossy().to_string(),
    )
}

#[cfg(not(unix))]
fn daemon_transport_label(_paths: &KeysteadPaths) -> (String, String) {
    (
        "tcp_loopback".to_owned(),
        crate::rpc::server::LOOPBACK_ADDR.to_owned(),
    )
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

#[cfg(unix)]
async fn connect_daemon(paths: &KeysteadPaths) -> std::io::Result<()> {
    UnixStream::connect(paths.socket_path()).await.map(drop)
}

#[cfg(not(unix))]
async fn connect_daemon(_paths: &KeysteadPaths) -> std::io::Result<()> {
    TcpStream::connect(crate::rpc::server::LOOPBACK_ADDR)
        .await
        .map(drop)
}

/// Connect only; nothing is sent.
async fn probe_daemon_running(paths: &KeysteadPaths) -> (bool, Option<String>) {
    let timeout = std::time::Duration::from_millis(250);
    match tokio::time::timeout(timeout, connect_daemon(paths)).await {
        Ok(Ok(())) => (true, None),
        Ok(Err(e)) => (false, Some(format!("connect failed: {e}"))),
        Err(_) => (false, Some("connect timed out".to_owned())),
    }
}

fn try_parse_config(path: &Path) -> eyre::Result<KeysteadConfig> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KeysteadConfig = toml::from_str(&s).context("parse config.toml")?;
    cfg.validate()?;
    Ok(cfg)
}

struct ConfigReport {
    path: PathBuf,
    exists: bool,
    parse_ok: bool,
    error: Option<String>,
    default_network: Option<String>,
    network_ids: Vec<String>,
    kdf: Option<serde_json::Value>,
}

/// Flags and key presence only; blob contents are never read into the report.
struct WalletReport {
    state_dir: PathBuf,
    exists: bool,
    is_initialized: Option<bool>,
    is_locked: Option<bool>,
    setup_complete: Option<bool>,
    setup_in_progress: bool,
    selected_network: Option<String>,
    present_keys: Vec<&'static str>,
    error: Option<String>,
}

struct DaemonReport {
    lock_path: PathBuf,
    lock_exists: bool,
    transport: String,
    address: String,
    reachable: bool,
    note: Option<String>,
}

struct DoctorReport {
    version: &'static str,
    paths: KeysteadPaths,
    config: ConfigReport,
    wallet: WalletReport,
    daemon: DaemonReport,
    env: serde_json::Value,
}

fn collect_config(paths: &KeysteadPaths) -> ConfigReport {
    let path = paths.config_file();
    let exists = path.exists();
    let (parse_ok, error, cfg) = if exists {
        match try_parse_config(&path) {
            Ok(cfg) => (true, None, Some(cfg)),
            Err(e) => (false, Some(format!("{e:#}")), None),
        }
    } else {
        (false, None, None)
    };
    ConfigReport {
        path,
        exists,
        parse_ok,
        error,
        default_network: cfg.as_ref().map(|c| c.default_network.clone()),
        network_ids: cfg
            .as_ref()
            .map(|c| c.networks.iter().map(|n| n.id.clone()).collect())
            .unwrap_or_default(),
        kdf: cfg.as_ref().map(|c| {
            json!({
              "memory_kib": c.kdf.memory_kib,
              "iterations": c.kdf.iterations,
              "parallelism": c.kdf.parallelism,
            })
        }),
    }
}

fn read_wallet_flags(dir: &Path, report: &mut WalletReport) -> eyre::Result<()> {
    let kv = FileKvStore::open(dir.to_path_buf())?;
    for key in StateKey::ALL {
        if kv.get(key)?.is_some() {
            report.present_keys.push(key.as_str());
        }
    }
    report.is_initialized = Some(store::load_flag(&kv, StateKey::IsInitialized)?);
    report.is_locked = Some(store::load_flag(&kv, StateKey::IsLocked)?);
    report.setup_complete = Some(store::load_flag(&kv, StateKey::SetupComplete)?);
    report.setup_in_progress = report.present_keys.contains(&StateKey::SetupProgress.as_str());
    report.selected_network = store::load_json(&kv, StateKey::SelectedNetwork)?;
    Ok(())
}

fn collect_wallet(paths: &KeysteadPaths) -> WalletReport {
    let state_dir = paths.state_dir();
    let mut report = WalletReport {
        exists: state_dir.is_dir(),
        state_dir,
        is_initialized: None,
        is_locked: None,
        setup_complete: None,
        setup_in_progress: false,
        selected_network: None,
        present_keys: vec![],
        error: None,
    };
    // Opening a missing directory would create it.
    if report.exists {
        let dir = report.state_dir.clone();
        if let Err(e) = read_wallet_flags(&dir, &mut report) {
            report.error = Some(format!("{e:#}"));
        }
    }
    report
}

async fn collect(paths: &KeysteadPaths) -> DoctorReport {
    let (transport, address) = daemon_transport_label(paths);
    let lock_path = paths.daemon_lock_path();
    let lock_exists = lock_path.exists();
    let (reachable, note) = probe_daemon_running(paths).await;

    let env = json!({
      "KEYSTEAD_CONFIG_DIR": env_opt("KEYSTEAD_CONFIG_DIR"),
      "KEYSTEAD_DATA_DIR": env_opt("KEYSTEAD_DATA_DIR"),
      "KEYSTEAD_DEFAULT_NETWORK": env_opt("KEYSTEAD_DEFAULT_NETWORK"),
      "KEYSTEAD_KDF_MEMORY_KIB": env_opt("KEYSTEAD_KDF_MEMORY_KIB"),
      "KEYSTEAD_KDF_ITERATIONS": env_opt("KEYSTEAD_KDF_ITERATIONS"),
      "KEYSTEAD_SETUP_TTL_SECONDS": env_opt("KEYSTEAD_SETUP_TTL_SECONDS"),
      "RUST_LOG": env_opt("RUST_LOG"),
    });

    DoctorReport {
        version: env!("CARGO_PKG_VERSION"),
        paths: paths.clone(),
        config: collect_config(paths),
        wallet: collect_wallet(paths),
        daemon: DaemonReport {
            lock_path,
            lock_exists,
            transport,
            address,
            reachable,
            note,
        },
        env,
    }
}

fn to_json(r: &DoctorReport) -> serde_json::Value {
    json!({
      "ok": r.config.error.is_none() && r.wallet.error.is_none(),
      "version": r.version,
      "paths": {
        "config_dir": r.paths.config_dir,
        "data_dir": r.paths.data_dir,
        "log_file": r.paths.log_file,
      },
      "config": {
        "path": r.config.path,
        "exists": r.config.exists,
        "parse_ok": r.config.parse_ok,
        "error": r.config.error,
        "default_network": r.config.default_network,
        "networks": r.config.network_ids,
        "kdf": r.config.kdf,
      },
      "wallet": {
        "state_dir": r.wallet.state_dir,
        "exists": r.wallet.exists,
        "is_initialized": r.wallet.is_initialized,
        "is_locked": r.wallet.is_locked,
        "setup_complete": r.wallet.setup_complete,
        "setup_in_progress": r.wallet.setup_in_progress,
        "selected_network": r.wallet.selected_network,
        "present_keys": r.wallet.present_keys,
        "error": r.wallet.error,
      },
      "daemon": {
        "lock_path": r.daemon.lock_path,
        "lock_exists": r.daemon.lock_exists,
        "transport": r.daemon.transport,
        "address": r.daemon.address,
        "reachable": r.daemon.reachable,
        "note": r.daemon.note,
      },
      "env": r.env,
    })
}

fn print_json(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(&to_json(r)).context("serialize doctor json")?;
    writeln!(out, "{s}").context("write doctor json")?;
    Ok(())
}

fn flag(v: Option<bool>) -> &'static str {
    match v {
        Some(true) => "yes",
        Some(false) => "no",
        None => "unknown",
    }
}

fn print_human(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    writeln!(out, "Keystead doctor (v{})", r.version).context("write header")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Paths:").context("write paths header")?;
    writeln!(out, "  config_dir: {}", r.paths.config_dir.display()).context("write paths")?;
    writeln!(out, "  data_dir:   {}", r.paths.data_dir.display()).context("write paths")?;
    writeln!(out, "  log_file:   {}", r.paths.log_file.display()).context("write paths")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Config:").context("write config header")?;
    writeln!(out, "  config.toml: {}", r.config.path.display()).context("write config")?;
    if !r.config.exists {
        writeln!(out, "  status: missing (will be created on first run)")
            .context("write config")?;
    } else if r.config.parse_ok {
        writeln!(
            out,
            "  status: ok (default_network: {}, networks: {})",
            r.config.default_network.as_deref().unwrap_or("-"),
            r.config.network_ids.join(", ")
        )
        .context("write config")?;
    } else {
        writeln!(out, "  status: invalid").context("write config")?;
        if let Some(e) = &r.config.error {
            let first = e.lines().next().unwrap_or("parse error");
            writeln!(out, "  error: {first}").context("write config")?;
        }
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Wallet:").context("write wallet header")?;
    writeln!(out, "  state_dir: {}", r.wallet.state_dir.display()).context("write wallet")?;
    if r.wallet.exists {
        writeln!(out, "  initialized: {}", flag(r.wallet.is_initialized)).context("write wallet")?;
        writeln!(out, "  locked: {}", flag(r.wallet.is_locked)).context("write wallet")?;
        writeln!(out, "  setup_in_progress: {}", r.wallet.setup_in_progress)
            .context("write wallet")?;
        if let Some(n) = &r.wallet.selected_network {
            writeln!(out, "  selected_network: {n}").context("write wallet")?;
        }
    } else {
        writeln!(out, "  status: no wallet yet").context("write wallet")?;
    }
    if let Some(e) = &r.wallet.error {
        writeln!(out, "  error: {e}").context("write wallet")?;
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Daemon:").context("write daemon header")?;
    writeln!(out, "  lock_path: {}", r.daemon.lock_path.display()).context("write daemon")?;
    writeln!(out, "  lock_exists: {}", r.daemon.lock_exists).context("write daemon")?;
    writeln!(out, "  transport: {}", r.daemon.transport).context("write daemon")?;
    writeln!(out, "  address: {}", r.daemon.address).context("write daemon")?;
    writeln!(out, "  reachable: {}", r.daemon.reachable).context("write daemon")?;
    if let Some(note) = &r.daemon.note {
        writeln!(out, "  note: {note}").context("write daemon")?;
    }
    Ok(())
}

pub async fn run(paths: &KeysteadPaths, as_json: bool) -> eyre::Result<()> {
    let report = collect(paths).await;
    let mut out = std::io::stdout().lock();
    if as_json {
        print_json(&mut out, &report)
    } else {
        print_human(&mut out, &report)
    }
}
