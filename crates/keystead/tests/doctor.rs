use std::process::Command;

use eyre::Context as _;

#[test]
fn doctor_json_runs_and_returns_valid_json() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("keystead");

    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("KEYSTEAD_CONFIG_DIR", cfg_dir.path())
        .env("KEYSTEAD_DATA_DIR", data_dir.path())
        .args(["doctor", "--json"])
        .output()
        .context("run keystead doctor --json")?;

    assert!(
        out.status.success(),
        "doctor exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse doctor json")?;
    assert_eq!(v.get("ok").and_then(serde_json::Value::as_bool), Some(true));
    assert!(v.get("version").and_then(|x| x.as_str()).is_some(), "version");
    assert!(v.get("paths").and_then(|x| x.as_object()).is_some(), "paths");
    assert_eq!(
        v.pointer("/wallet/is_initialized").and_then(serde_json::Value::as_bool),
        Some(false),
        "fresh data dir: {v}"
    );
    Ok(())
}

#[test]
fn paths_and_networks_print_json() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(assert_cmd::cargo::cargo_bin!("keystead"))
        .env("KEYSTEAD_CONFIG_DIR", cfg_dir.path())
        .env("KEYSTEAD_DATA_DIR", data_dir.path())
        .arg("paths")
        .output()
        .context("run keystead paths")?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse paths json")?;
    assert_eq!(
        v.get("data_dir").and_then(|x| x.as_str()),
        data_dir.path().to_str(),
        "override honoured"
    );

    let out = Command::new(assert_cmd::cargo::cargo_bin!("keystead"))
        .env("KEYSTEAD_CONFIG_DIR", cfg_dir.path())
        .env("KEYSTEAD_DATA_DIR", data_dir.path())
        .env("KEYSTEAD_RPC_URL_GANACHE", "http://127.0.0.1:8545")
        .arg("networks")
        .output()
        .context("run keystead networks")?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse networks json")?;
    assert_eq!(v.get("default").and_then(|x| x.as_str()), Some("ethereum"));
    let ids: Vec<&str> = v
        .get("networks")
        .and_then(|x| x.as_array())
        .map(|a| a.iter().filter_map(|n| n.get("id")?.as_str()).collect())
        .unwrap_or_default();
    assert!(ids.contains(&"solana-devnet"), "{ids:?}");
    let ganache = v
        .get("networks")
        .and_then(|x| x.as_array())
        .and_then(|a| a.iter().find(|n| n.get("id").and_then(|i| i.as_str()) == Some("ganache")));
    assert_eq!(
        ganache.and_then(|n| n.get("rpcUrl")).and_then(|x| x.as_str()),
        Some("http://127.0.0.1:8545"),
        "env override applied"
    );
    assert!(
        cfg_dir.path().join("config.toml").exists(),
        "defaults written on first run"
    );
    Ok(())
}
