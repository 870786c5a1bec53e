use crate::{
    errors::WalletError,
    signing::{
        evm::{parse_address, parse_data},
        EvmTransaction, Quantity,
    },
};
use alloy::{
    network::TransactionBuilder as _,
    primitives::{Address, Bytes},
    providers::{Provider as _, RootProvider},
    rpc::types::{BlockNumberOrTag, TransactionRequest},
};
use eyre::Context as _;
use reqwest::Client;
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(20);
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type EvmProvider = RootProvider;

pub fn provider_for_url(url: &str) -> eyre::Result<EvmProvider> {
    let u: reqwest::Url = url
        .parse()
        .with_context(|| format!("invalid rpc url: {url}"))?;
    let client = Client::builder()
        .timeout(RPC_TIMEOUT)
        .connect_timeout(RPC_CONNECT_TIMEOUT)
        .build()
        .context("build rpc http client")?;
    let http = alloy::transports::http::Http::with_client(client, u);
    let rpc_client = alloy::rpc::client::RpcClient::new(http, false);
    Ok(RootProvider::new(rpc_client))
}

/// priority = max(1.5 gwei, gas_price / 10); max_fee = 2 * base_fee + priority.
pub fn compute_eip1559_fees(base_fee: u128, gas_price: u128) -> (u128, u128) {
    let min_priority: u128 = 1_500_000_000;
    let priority = std::cmp::max(min_priority, gas_price / 10);
    let max_fee = base_fee
        .saturating_mul(2)
        .saturating_add(priority)
        .max(base_fee.saturating_add(priority));
    (max_fee, priority)
}

/// Prefer EIP-1559 when the chain reports a base fee. Fee fields the caller
/// already set are never touched.
pub fn apply_fee_policy(mut tx: EvmTransaction, base_fee: Option<u128>, gas_price: u128) -> EvmTransaction {
    if tx.gas_price.is_some() || tx.max_fee_per_gas.is_some() || tx.max_priority_fee_per_gas.is_some() {
        return tx;
    }
    if let Some(base_fee) = base_fee {
        let (max_fee, priority) = compute_eip1559_fees(base_fee, gas_price);
        tx.max_fee_per_gas = Some(Quantity::hex(max_fee));
        tx.max_priority_fee_per_gas = Some(Quantity::hex(priority));
    } else {
        tx.gas_price = Some(Quantity::hex(gas_price));
    }
    tx
}

/// Same fields as an RPC call object, for `eth_estimateGas`.
pub fn to_request(tx: &EvmTransaction) -> Result<TransactionRequest, WalletError> {
    let mut req = TransactionRequest::default();
    if let Some(from) = &tx.from {
        req = req.with_from(parse_address(from)?);
    }
    if let Some(to) = tx.to.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        req = req.with_to(parse_address(to)?);
    }
    if let Some(v) = &tx.value {
        req = req.with_value(v.to_u256()?);
    }
    let data = parse_data(tx.data.as_deref())?;
    if !data.is_empty() {
        req = req.with_input(data);
    }
    if let Some(n) = &tx.nonce {
        req = req.with_nonce(n.to_u64()?);
    }
    if let Some(gp) = &tx.gas_price {
        req = req.with_gas_price(gp.to_u128()?);
    }
    if let Some(f) = &tx.max_fee_per_gas {
        req = req.with_max_fee_per_gas(f.to_u128()?);
    }
    if let Some(p) = &tx.max_priority_fee_per_gas {
        req = req.with_max_priority_fee_per_gas(p.to_u128()?);
    }
    if let Some(c) = &tx.chain_id {
        req = req.with_chain_id(c.to_u64()?);
    }
    Ok(req)
}

pub async fn estimate_gas(provider: &EvmProvider, tx: &EvmTransaction) -> eyre::Result<u64> {
    provider
        .estimate_gas(to_request(tx)?)
        .await
        .context("estimate gas")
}

/// Fill chain id, sender, fees, nonce and gas limit where absent.
pub async fn fill_missing(
    provider: &EvmProvider,
    from: Address,
    chain_id: u64,
    mut tx: EvmTransaction,
) -> eyre::Result<EvmTransaction> {
    if tx.chain_id.is_none() {
        tx.chain_id = Some(Quantity::hex(chain_id));
    }
    if tx.from.is_none() {
        tx.from = Some(from.to_checksum(None));
    }

    if !tx.has_fees() {
        let base_fee = provider
            .get_block_by_number(BlockNumberOrTag::Pending)
            .await
            .ok()
            .flatten()
            .and_then(|b| b.header.base_fee_per_gas.map(u128::from));
        let gp = provider.get_gas_price().await.context("get gas price")?;
        tx = apply_fee_policy(tx, base_fee, gp);
    }

    if tx.nonce.is_none() {
        let n = provider
            .get_transaction_count(from)
            .pending()
            .await
            .context("get nonce")?;
        tx.nonce = Some(Quantity::Number(n));
    }

    if tx.gas_limit.is_none() {
        let gas = estimate_gas(provider, &tx).await?;
        // Buffer for flaky estimators.
        tx.gas_limit = Some(Quantity::Number(gas.saturating_mul(120) / 100));
    }
    Ok(tx)
}

fn broadcast_err_is_ok(err: &eyre::Report) -> bool {
    let s = format!("{err:#}").to_lowercase();
    s.contains("already known")
        || s.contains("known transaction")
        || s.contains("already imported")
        || s.contains("already in mempool")
}

/// A node that already holds the transaction counts as success.
pub async fn send_raw(provider: &EvmProvider, raw: &Bytes) -> eyre::Result<()> {
    match provider.send_raw_transaction(raw).await {
        Ok(_pending) => Ok(()),
        Err(e) => {
            let ae: eyre::Report = e.into();
            if broadcast_err_is_ok(&ae) {
                Ok(())
            } else {
                Err(ae).context("broadcast raw tx")
            }
        }
    }
}

pub fn decode_raw(raw_hex: &str) -> Result<Bytes, WalletError> {
    let h = raw_hex.trim();
    hex::decode(h.strip_prefix("0x").unwrap_or(h))
        .map(Bytes::from)
        .map_err(|e| WalletError::invalid_params(format!("raw transaction is not hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_policy_is_conservative() {
        let (max_fee, priority) = compute_eip1559_fees(10_000_000_000, 20_000_000_000);
        assert_eq!(priority, 2_000_000_000, "gas_price / 10");
        assert_eq!(max_fee, 22_000_000_000, "2 * base + priority");

        let (_, floor) = compute_eip1559_fees(1_000_000_000, 5_000_000_000);
        assert_eq!(floor, 1_500_000_000, "priority floor");
    }

    #[test]
    fn fee_policy_prefers_1559_and_respects_caller_fees() -> eyre::Result<()> {
        let out = apply_fee_policy(EvmTransaction::default(), Some(10_000_000_000), 20_000_000_000);
        assert!(out.max_fee_per_gas.is_some() && out.max_priority_fee_per_gas.is_some(), "1559");
        assert!(out.gas_price.is_none(), "no legacy price");

        let legacy = apply_fee_policy(EvmTransaction::default(), None, 7);
        assert_eq!(legacy.gas_price.as_ref().map(Quantity::to_u128).transpose()?, Some(7));

        let mine = EvmTransaction {
            gas_price: Some(Quantity::Number(3)),
            ..EvmTransaction::default()
        };
        assert_eq!(apply_fee_policy(mine.clone(), Some(1), 1), mine);
        Ok(())
    }

    #[test]
    fn request_mirrors_the_transaction() -> eyre::Result<()> {
        let tx = EvmTransaction {
            from: Some("0x9858EfFD232B4033E47d90003D41EC34EcaEda94".to_owned()),
            to: Some("0x0000000000000000000000000000000000000001".to_owned()),
            value: Some(Quantity::Text("0x10".to_owned())),
            data: Some("0xdeadbeef".to_owned()),
            nonce: Some(Quantity::Number(3)),
            ..EvmTransaction::default()
        };
        let req = to_request(&tx)?;
        assert_eq!(req.nonce, Some(3));
        assert_eq!(req.from, Some(parse_address("0x9858EfFD232B4033E47d90003D41EC34EcaEda94")?));
        assert!(
            to_request(&EvmTransaction {
                to: Some("nope".to_owned()),
                ..EvmTransaction::default()
            })
            .is_err(),
            "bad address"
        );
        Ok(())
    }

    #[test]
    fn raw_hex_decodes() -> eyre::Result<()> {
        assert_eq!(decode_raw("0x02ab")?.to_vec(), vec![0x02, 0xab]);
        assert!(decode_raw("0xzz").is_err(), "not hex");
        Ok(())
    }
}
