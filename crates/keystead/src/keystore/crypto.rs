use crate::{config::KdfConfig, errors::WalletError};
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

pub const BLOB_VERSION: u8 = 1;
pub const ALG_ARGON2ID_AES256GCM: &str = "argon2id+hkdf-sha256+aes-256-gcm";

/// Argon2id cost parameters, stored with every blob so a config change never
/// strands data encrypted under older settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_kib: u32,
    pub t: u32,
    pub p: u32,
}

impl From<&KdfConfig> for KdfParams {
    fn from(c: &KdfConfig) -> Self {
        Self {
            m_kib: c.memory_kib,
            t: c.iterations,
            p: c.parallelism,
        }
    }
}

impl KdfParams {
    fn argon2(self) -> eyre::Result<Argon2<'static>> {
        let params = Params::new(self.m_kib, self.t, self.p, Some(32))
            .map_err(|e| eyre::eyre!("argon2 params: {e}"))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// The only at-rest form of the recovery phrase and of private keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub v: u8,
    pub alg: String,
    pub kdf: KdfParams,
    pub salt_b64: String,
    pub nonce_b64: String,
    pub ct_b64: String,
}

/// Password-based authenticated encryption of opaque secrets.
///
/// `purpose` binds a blob to its slot: a blob moved to another slot fails to
/// decrypt even under the right password.
pub trait SecretCipher: Send + Sync + std::fmt::Debug {
    fn encrypt(
        &self,
        plaintext: &[u8],
        password: &SecretString,
        purpose: &str,
    ) -> eyre::Result<EncryptedBlob>;

    /// Every failure (wrong password, tampered or malformed blob) is
    /// `WalletError::WrongPassword`.
    fn decrypt(
        &self,
        blob: &EncryptedBlob,
        password: &SecretString,
        purpose: &str,
    ) -> eyre::Result<Zeroizing<Vec<u8>>>;
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Argon2id stretches the password, HKDF-SHA256 derives a per-purpose
/// subkey, AES-256-GCM seals the payload.
#[derive(Debug, Clone, Copy)]
pub struct Argon2AesGcm {
    params: KdfParams,
}

impl Argon2AesGcm {
    pub fn new(cfg: &KdfConfig) -> eyre::Result<Self> {
        let params = KdfParams::from(cfg);
        params.argon2()?;
        Ok(Self { params })
    }

    fn blob_key(
        params: KdfParams,
        password: &SecretString,
        salt: &[u8],
        purpose: &str,
    ) -> eyre::Result<Zeroizing<[u8; 32]>> {
        let mut stretched = Zeroizing::new([0_u8; 32]);
        params
            .argon2()?
            .hash_password_into(
                password.expose_secret().as_bytes(),
                salt,
                stretched.as_mut_slice(),
            )
            .map_err(|e| eyre::eyre!("argon2: {e}"))?;

        let hk = Hkdf::<Sha256>::new(None, stretched.as_slice());
        let info = format!("keystead:{purpose}");
        let mut key = Zeroizing::new([0_u8; 32]);
        hk.expand(info.as_bytes(), key.as_mut_slice())
            .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
        Ok(key)
    }

    fn open(
        blob: &EncryptedBlob,
        password: &SecretString,
        purpose: &str,
    ) -> eyre::Result<Zeroizing<Vec<u8>>> {
        if blob.v != BLOB_VERSION || blob.alg != ALG_ARGON2ID_AES256GCM {
            eyre::bail!("unsupported blob v{} {}", blob.v, blob.alg);
        }
        let salt = b64().decode(&blob.salt_b64)?;
        let nonce = b64().decode(&blob.nonce_b64)?;
        if nonce.len() != 12 {
            eyre::bail!("invalid nonce length");
        }
        let ct = b64().decode(&blob.ct_b64)?;

        let key = Self::blob_key(blob.kdf, password, &salt, purpose)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| eyre::eyre!("aes init: {e}"))?;
        let pt = cipher
            .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
            .map_err(|e| eyre::eyre!("aes decrypt: {e}"))?;
        Ok(Zeroizing::new(pt))
    }
}

impl SecretCipher for Argon2AesGcm {
    fn encrypt(
        &self,
        plaintext: &[u8],
        password: &SecretString,
        purpose: &str,
    ) -> eyre::Result<EncryptedBlob> {
        if password.expose_secret().is_empty() {
            return Err(WalletError::invalid_params("password must not be empty").into());
        }
        let mut salt = [0_u8; 16];
        fill_random(&mut salt);
        let mut nonce = [0_u8; 12];
        fill_random(&mut nonce);

        let key = Self::blob_key(self.params, password, &salt, purpose)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| eyre::eyre!("aes init: {e}"))?;
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;

        Ok(EncryptedBlob {
            v: BLOB_VERSION,
            alg: ALG_ARGON2ID_AES256GCM.to_owned(),
            kdf: self.params,
            salt_b64: b64().encode(salt),
            nonce_b64: b64().encode(nonce),
            ct_b64: b64().encode(ct),
        })
    }

    fn decrypt(
        &self,
        blob: &EncryptedBlob,
        password: &SecretString,
        purpose: &str,
    ) -> eyre::Result<Zeroizing<Vec<u8>>> {
        if password.expose_secret().is_empty() {
            return Err(WalletError::WrongPassword.into());
        }
        Self::open(blob, password, purpose).map_err(|e| {
            tracing::debug!(purpose, error = %e, "blob did not open");
            WalletError::WrongPassword.into()
        })
    }
}

/// Salted Argon2id PHC string, used to re-authenticate an interrupted setup.
pub fn hash_password(password: &SecretString, params: KdfParams) -> eyre::Result<String> {
    let mut raw = [0_u8; 16];
    fill_random(&mut raw);
    let salt = SaltString::encode_b64(&raw).map_err(|e| eyre::eyre!("encode salt: {e}"))?;
    let phc = params
        .argon2()?
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|e| eyre::eyre!("argon2 hash: {e}"))?;
    Ok(phc.to_string())
}

pub fn verify_password_hash(password: &SecretString, phc: &str) -> bool {
    PasswordHash::new(phc).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;
    use eyre::ContextCompat as _;

    fn wallet_error(e: &eyre::Report) -> Option<&WalletError> {
        e.downcast_ref::<WalletError>()
    }

    #[test]
    fn round_trip_under_same_password() -> eyre::Result<()> {
        let c = testkit::cheap_cipher()?;
        let blob = c.encrypt(b"twelve words here", &testkit::pw("correct-horse-battery"), "mnemonic")?;
        let out = c.decrypt(&blob, &testkit::pw("correct-horse-battery"), "mnemonic")?;
        assert_eq!(out.as_slice(), b"twelve words here");
        assert_eq!(blob.alg, ALG_ARGON2ID_AES256GCM);
        Ok(())
    }

    #[test]
    fn wrong_password_and_tampering_look_identical() -> eyre::Result<()> {
        let c = testkit::cheap_cipher()?;
        let blob = c.encrypt(b"secret", &testkit::pw("password-one"), "mnemonic")?;

        let wrong = c
            .decrypt(&blob, &testkit::pw("password-two"), "mnemonic")
            .err()
            .context("wrong password must fail")?;
        assert_eq!(wallet_error(&wrong), Some(&WalletError::WrongPassword));

        let mut tampered = blob.clone();
        tampered.ct_b64 = b64().encode(b"garbage-garbage-garbage");
        let corrupt = c
            .decrypt(&tampered, &testkit::pw("password-one"), "mnemonic")
            .err()
            .context("tampered blob must fail")?;
        assert_eq!(wallet_error(&corrupt), Some(&WalletError::WrongPassword));

        let moved = c
            .decrypt(&blob, &testkit::pw("password-one"), "key:ethereum/0")
            .err()
            .context("blob bound to its slot")?;
        assert_eq!(wallet_error(&moved), Some(&WalletError::WrongPassword));
        Ok(())
    }

    #[test]
    fn empty_password_is_refused() -> eyre::Result<()> {
        let c = testkit::cheap_cipher()?;
        assert!(c.encrypt(b"x", &testkit::pw(""), "mnemonic").is_err(), "encrypt");
        let blob = c.encrypt(b"x", &testkit::pw("nonempty"), "mnemonic")?;
        assert!(c.decrypt(&blob, &testkit::pw(""), "mnemonic").is_err(), "decrypt");
        Ok(())
    }

    #[test]
    fn salts_differ_per_blob() -> eyre::Result<()> {
        let c = testkit::cheap_cipher()?;
        let a = c.encrypt(b"same", &testkit::pw("same-password"), "mnemonic")?;
        let b = c.encrypt(b"same", &testkit::pw("same-password"), "mnemonic")?;
        assert_ne!(a.salt_b64, b.salt_b64);
        assert_ne!(a.ct_b64, b.ct_b64);
        Ok(())
    }

    #[test]
    fn password_hash_verifies_only_the_original() -> eyre::Result<()> {
        let params = KdfParams {
            m_kib: 64,
            t: 1,
            p: 1,
        };
        let phc = hash_password(&testkit::pw("correct-horse-battery"), params)?;
        assert!(!phc.contains("correct-horse"), "plaintext never stored");
        assert!(verify_password_hash(&testkit::pw("correct-horse-battery"), &phc), "same");
        assert!(!verify_password_hash(&testkit::pw("wrong-password"), &phc), "different");
        assert!(!verify_password_hash(&testkit::pw("x"), "not-a-phc"), "garbage hash");
        Ok(())
    }
}
