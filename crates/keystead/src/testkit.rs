//! Fixtures shared by the unit tests: cheap KDF parameters, a well-known
//! phrase and a chain collaborator that never leaves the process.

use crate::{
    chains::ChainRpc,
    config::{KdfConfig, KeysteadConfig},
    keystore::crypto::Argon2AesGcm,
    lifecycle::{now_ms, WalletMachine},
    network::{Network, NetworkRegistry},
    signing::{solana::encode_transaction, EvmTransaction, Quantity, SignatureOutput},
    store::{KvStore, MemoryKvStore},
};
use secrecy::SecretString;
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};
use std::sync::{Arc, Mutex};

pub const ABANDON: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
/// m/44'/60'/0'/0/0 of `ABANDON`.
pub const ABANDON_ETH: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";

pub fn pw(s: &str) -> SecretString {
    SecretString::new(s.to_owned().into())
}

pub fn cheap_config() -> KeysteadConfig {
    KeysteadConfig {
        kdf: KdfConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
        ..KeysteadConfig::default()
    }
}

pub fn cheap_cipher() -> eyre::Result<Argon2AesGcm> {
    Argon2AesGcm::new(&cheap_config().kdf)
}

pub fn network(id: &str) -> eyre::Result<Network> {
    let reg = NetworkRegistry::load(&KeysteadConfig::default(), Arc::new(MemoryKvStore::default()))?;
    Ok(reg.by_id(id)?.clone())
}

pub fn machine(store: &Arc<MemoryKvStore>) -> eyre::Result<WalletMachine> {
    machine_at(store, now_ms())
}

pub fn machine_at(store: &Arc<MemoryKvStore>, now_ms: i64) -> eyre::Result<WalletMachine> {
    let cfg = cheap_config();
    let dyn_store: Arc<dyn KvStore> = Arc::<MemoryKvStore>::clone(store);
    let networks = NetworkRegistry::load(&cfg, Arc::clone(&dyn_store))?;
    WalletMachine::load_at(&cfg, dyn_store, Arc::new(cheap_cipher()?), networks, now_ms)
}

/// Base64 transaction with one empty signature slot per signer; the first
/// signer pays. Each call targets a fresh program id, so two calls never
/// produce the same message.
pub fn unsigned_solana_tx(signers: &[Pubkey]) -> eyre::Result<String> {
    let payer = signers.first().copied().ok_or_else(|| eyre::eyre!("no payer"))?;
    let metas = signers.iter().map(|k| AccountMeta::new(*k, true)).collect();
    let ix = Instruction::new_with_bytes(Pubkey::new_unique(), &[1, 2, 3], metas);
    let tx = VersionedTransaction {
        signatures: vec![Signature::default(); signers.len()],
        message: VersionedMessage::Legacy(Message::new(&[ix], Some(&payer))),
    };
    encode_transaction(&tx)
}

/// Fills what a node would and records every broadcast.
#[derive(Debug, Default)]
pub struct StubChains {
    pub broadcasts: Mutex<Vec<(String, SignatureOutput)>>,
}

impl StubChains {
    pub fn sent(&self) -> eyre::Result<Vec<(String, SignatureOutput)>> {
        Ok(self
            .broadcasts
            .lock()
            .map_err(|e| eyre::eyre!("poisoned: {e}"))?
            .clone())
    }
}

impl ChainRpc for StubChains {
    async fn prepare_evm_transaction(
        &self,
        network: &Network,
        from: &str,
        mut tx: EvmTransaction,
    ) -> eyre::Result<EvmTransaction> {
        tx.from.get_or_insert_with(|| from.to_owned());
        if let Some(id) = network.chain_id {
            tx.chain_id.get_or_insert(Quantity::Number(id));
        }
        tx.nonce.get_or_insert(Quantity::Number(0));
        tx.gas_limit.get_or_insert(Quantity::Number(21_000));
        if !tx.has_fees() {
            tx.gas_price = Some(Quantity::Number(1_000_000_000));
        }
        Ok(tx)
    }

    async fn estimate_gas(&self, _network: &Network, _tx: &EvmTransaction) -> eyre::Result<u64> {
        Ok(21_000)
    }

    async fn broadcast(&self, network: &Network, signed: &SignatureOutput) -> eyre::Result<String> {
        self.broadcasts
            .lock()
            .map_err(|e| eyre::eyre!("poisoned: {e}"))?
            .push((network.id.clone(), signed.clone()));
        match signed {
            SignatureOutput::EvmTransaction { tx_hash, .. } => Ok(tx_hash.clone()),
            SignatureOutput::SolanaTransaction { signatures, .. } => signatures
                .first()
                .cloned()
                .ok_or_else(|| eyre::eyre!("no signatures")),
            SignatureOutput::EvmMessage { .. } | SignatureOutput::SolanaMessage { .. } => {
                eyre::bail!("not a transaction")
            }
        }
    }
}
