use eyre::Context as _;
use predicates::prelude::*;
use serde_json::{json, Value};

const ABANDON: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const ABANDON_ETH: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";

fn keystead(cfg: &tempfile::TempDir, data: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("keystead"));
    cmd.env("KEYSTEAD_CONFIG_DIR", cfg.path())
        .env("KEYSTEAD_DATA_DIR", data.path())
        .env("KEYSTEAD_KDF_MEMORY_KIB", "64")
        .env("KEYSTEAD_KDF_ITERATIONS", "1")
        .env_remove("RUST_LOG");
    cmd
}

fn script(lines: &[Value]) -> eyre::Result<String> {
    let mut s = String::new();
    for l in lines {
        s.push_str(&serde_json::to_string(l)?);
        s.push('\n');
    }
    Ok(s)
}

fn replies(stdout: &[u8]) -> eyre::Result<Vec<Value>> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|l| serde_json::from_str(l).with_context(|| format!("parse reply {l}")))
        .collect()
}

fn by_id<'a>(replies: &'a [Value], id: &Value) -> eyre::Result<&'a Value> {
    replies
        .iter()
        .find(|r| r.get("id") == Some(id))
        .ok_or_else(|| eyre::eyre!("no reply with id {id} in {replies:?}"))
}

#[test]
fn recovered_wallet_serves_ui_and_page_requests() -> eyre::Result<()> {
    let cfg = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let input = script(&[
        json!({"type": "GET_WALLET_STATE", "id": 1}),
        json!({"type": "RECOVER_WALLET", "id": 2, "seedPhrase": ABANDON, "password": "correct-horse-battery"}),
        json!({"type": "COMPLETE_SETUP", "id": 3}),
        json!({"type": "SIGN_MESSAGE", "id": 4, "address": ABANDON_ETH, "message": "hello"}),
        json!({"type": "WEB3_WALLET_REQUEST", "provider": "ethereum", "method": "eth_accounts", "params": [], "id": "acc"}),
    ])?;

    let out = keystead(&cfg, &data)
        .args(["serve", "--ephemeral"])
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains("WEB3_WALLET_RESPONSE"))
        .stdout(predicate::str::contains("abandon").not())
        .get_output()
        .stdout
        .clone();
    let replies = replies(&out)?;

    let first = by_id(&replies, &json!(1))?;
    assert_eq!(first["result"]["isInitialized"], json!(false), "{first}");

    let recovered = by_id(&replies, &json!(2))?;
    assert_eq!(recovered["success"], json!(true), "{recovered}");
    assert_eq!(recovered["result"]["phase"], json!("complete"), "{recovered}");

    let done = by_id(&replies, &json!(3))?;
    assert_eq!(done["result"]["isLocked"], json!(false), "{done}");
    assert_eq!(done["result"]["address"], json!(ABANDON_ETH), "{done}");

    let signed = by_id(&replies, &json!(4))?;
    assert!(
        signed["result"]["signature"].as_str().is_some_and(|s| s.starts_with("0x")),
        "{signed}"
    );

    let page = by_id(&replies, &json!("acc"))?;
    assert_eq!(page["type"], json!("WEB3_WALLET_RESPONSE"), "{page}");
    assert_eq!(page["result"], json!([ABANDON_ETH]), "{page}");

    assert!(
        !data.path().join("state").join("encryptedMnemonic.json").exists(),
        "ephemeral serve keeps state in memory"
    );
    Ok(())
}

#[test]
fn unknown_methods_and_providers_get_coded_errors() -> eyre::Result<()> {
    let cfg = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let input = script(&[
        json!({"type": "EXPORT_PRIVATE_KEY", "id": "x"}),
        json!({"type": "WEB3_WALLET_REQUEST", "provider": "bitcoin", "method": "getAccounts", "params": [], "id": "p1"}),
        json!({"type": "WEB3_WALLET_REQUEST", "provider": "ethereum", "method": "eth_getPrivateKey", "params": [], "id": "p2"}),
        json!({"type": "WEB3_WALLET_REQUEST", "provider": "ethereum", "method": "eth_requestAccounts", "params": [], "id": "p3"}),
    ])?;

    let out = keystead(&cfg, &data)
        .args(["serve", "--ephemeral"])
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let replies = replies(&out)?;

    assert_eq!(by_id(&replies, &json!("x"))?["code"], json!("UnknownMethodError"));
    assert_eq!(by_id(&replies, &json!("p1"))?["code"], json!("UnknownProviderError"));
    assert_eq!(by_id(&replies, &json!("p2"))?["code"], json!("UnknownMethodError"));
    assert_eq!(by_id(&replies, &json!("p3"))?["code"], json!("WalletLockedError"));
    Ok(())
}
