use crate::{config::SolanaDerivation, errors::WalletError};
use alloy::signers::local::{coins_bip39::English, MnemonicBuilder};
use bip39::{Language, Mnemonic};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use solana_derivation_path::DerivationPath as SolanaDerivationPath;
use solana_keypair::{seed_derivable::keypair_from_seed_and_derivation_path, Keypair};
use solana_signer::Signer as _;
use std::{collections::BTreeMap, fmt};
use zeroize::{Zeroize as _, Zeroizing};

/// Networks sharing a signature scheme and address format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Ethereum,
    Solana,
}

impl ChainFamily {
    pub const ALL: [Self; 2] = [Self::Ethereum, Self::Solana];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Solana => "solana",
        }
    }

    /// Parse a page provider name.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "ethereum" => Some(Self::Ethereum),
            "solana" => Some(Self::Solana),
            _ => None,
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a private key inside the vault. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(chain: ChainFamily, index: u32) -> Self {
        Self(format!("{chain}/{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub chain: ChainFamily,
    pub index: u32,
    pub address: String,
    pub key_ref: KeyRef,
}

impl Account {
    /// EVM addresses compare case-insensitively (checksum casing is cosmetic);
    /// base58 is case-sensitive.
    pub fn has_address(&self, address: &str) -> bool {
        match self.chain {
            ChainFamily::Ethereum => self.address.eq_ignore_ascii_case(address.trim()),
            ChainFamily::Solana => self.address == address.trim(),
        }
    }
}

/// Public account table, keyed by chain family. Persisted in clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountBook(BTreeMap<ChainFamily, Vec<Account>>);

impl AccountBook {
    pub fn for_chain(&self, chain: ChainFamily) -> &[Account] {
        self.0.get(&chain).map_or(&[], Vec::as_slice)
    }

    pub fn primary(&self, chain: ChainFamily) -> Option<&Account> {
        self.for_chain(chain).first()
    }

    pub fn find(&self, chain: ChainFamily, address: &str) -> Option<&Account> {
        self.for_chain(chain).iter().find(|a| a.has_address(address))
    }

    pub fn next_index(&self, chain: ChainFamily) -> u32 {
        self.for_chain(chain)
            .iter()
            .map(|a| a.index.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    pub fn push(&mut self, account: Account) {
        self.0.entry(account.chain).or_default().push(account);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.0.values().flatten()
    }

    pub fn addresses(&self) -> BTreeMap<ChainFamily, Vec<String>> {
        self.0
            .iter()
            .map(|(c, accts)| (*c, accts.iter().map(|a| a.address.clone()).collect()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

/// Lower-case the words and collapse whitespace.
pub fn normalize_phrase(s: &str) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(s.len()));
    for (i, w) in s.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.extend(w.chars().flat_map(char::to_lowercase));
    }
    out
}

/// A validated mnemonic in normalized form. Wiped on drop; never printed.
#[derive(Clone)]
pub struct RecoveryPhrase(Zeroizing<String>);

impl fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveryPhrase({} words, redacted)", self.word_count())
    }
}

impl RecoveryPhrase {
    /// Checks word-list membership, checksum and a 12/24 word count.
    pub fn parse(candidate: &str) -> Result<Self, WalletError> {
        let normalized = normalize_phrase(candidate);
        let words = normalized.split(' ').count();
        if !matches!(words, 12 | 24) {
            return Err(WalletError::InvalidPhrase);
        }
        Mnemonic::parse_in_normalized(Language::English, normalized.as_str())
            .map_err(|_invalid| WalletError::InvalidPhrase)?;
        Ok(Self(normalized))
    }

    pub fn generate(words: usize) -> eyre::Result<Self> {
        let m = Mnemonic::generate_in(Language::English, words).context("generate mnemonic")?;
        Ok(Self(Zeroizing::new(m.to_string())))
    }

    pub fn word_count(&self) -> usize {
        self.0.split(' ').count()
    }

    /// Exact, ordered comparison after normalization.
    pub fn matches(&self, words: &str) -> bool {
        *normalize_phrase(words) == *self.0
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }

    fn seed(&self) -> eyre::Result<Zeroizing<[u8; 64]>> {
        let m = Mnemonic::parse_in_normalized(Language::English, &self.0)
            .map_err(|_invalid| WalletError::InvalidPhrase)?;
        Ok(Zeroizing::new(m.to_seed_normalized("")))
    }
}

pub fn validate_phrase(candidate: &str) -> bool {
    RecoveryPhrase::parse(candidate).is_ok()
}

/// A derived keypair. The secret is wiped on drop and never printed.
pub struct DerivedKey {
    pub address: String,
    pub secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Mnemonic to seed to chain keypair.
///
/// Ethereum: m/44'/60'/0'/0/index, secret = 32-byte secp256k1 scalar.
/// Solana: see [`SolanaDerivation`]; secret = 64-byte keypair encoding.
pub fn derive(
    phrase: &RecoveryPhrase,
    chain: ChainFamily,
    index: u32,
    solana: SolanaDerivation,
) -> eyre::Result<DerivedKey> {
    match chain {
        ChainFamily::Ethereum => {
            let signer = MnemonicBuilder::<English>::default()
                .phrase(phrase.expose())
                .index(index)
                .context("evm index")?
                .build()
                .context("build evm wallet")?;
            Ok(DerivedKey {
                address: signer.address().to_checksum(None),
                secret: Zeroizing::new(signer.to_bytes().as_slice().to_vec()),
            })
        }
        ChainFamily::Solana => {
            let kp = solana_keypair(phrase, index, solana)?;
            Ok(DerivedKey {
                address: kp.pubkey().to_string(),
                secret: Zeroizing::new(kp.to_bytes().to_vec()),
            })
        }
    }
}

fn solana_keypair(
    phrase: &RecoveryPhrase,
    index: u32,
    scheme: SolanaDerivation,
) -> eyre::Result<Keypair> {
    let seed = phrase.seed()?;
    match scheme {
        SolanaDerivation::SeedPrefix => {
            if index != 0 {
                return Err(WalletError::invalid_params(
                    "seed-prefix solana derivation has a single account",
                )
                .into());
            }
            let mut secret = [0_u8; 32];
            let prefix = seed
                .get(..32)
                .ok_or_else(|| eyre::eyre!("seed too short"))?;
            secret.copy_from_slice(prefix);
            let kp = Keypair::new_from_array(secret);
            secret.zeroize();
            Ok(kp)
        }
        SolanaDerivation::Bip44 => {
            let path = SolanaDerivationPath::new_bip44(Some(index), Some(0));
            keypair_from_seed_and_derivation_path(seed.as_slice(), Some(path))
                .map_err(|e| eyre::eyre!("derive solana keypair: {e}"))
        }
    }
}
