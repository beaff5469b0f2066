//! Funding wallet key handling
//!
//! A game's funding wallet reaches the executor only as ciphertext. The
//! plaintext key is produced just-in-time by a [`KeyDecryptor`], turned into a
//! [`FundingSigner`] and dropped when the approval call returns.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ethabi::Address;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::zeroize::Zeroizing;
use rand::RngCore;
use std::fmt;

use crate::chain::types::{format_address, keccak256};
use crate::error::{Error, Result};

/// AES-GCM nonce length prefixed to every ciphertext
const NONCE_LEN: usize = 12;

/// Associated data binding ciphertexts to their purpose
const FUNDING_KEY_AAD: &[u8] = b"delegation-relay/funding-wallet/v1";

/// Capability to turn stored ciphertext back into private key bytes
pub trait KeyDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>>;
}

/// AES-256-GCM key decryptor
///
/// Ciphertext format: base64(12-byte nonce || ciphertext+tag).
pub struct AesGcmKeyDecryptor {
    kek: Zeroizing<[u8; 32]>,
}

impl AesGcmKeyDecryptor {
    pub fn new(kek: [u8; 32]) -> Self {
        Self {
            kek: Zeroizing::new(kek),
        }
    }

    /// Build from 64 hex characters (optionally `0x`-prefixed)
    pub fn from_hex(kek_hex: &str) -> Result<Self> {
        let trimmed = kek_hex.trim().trim_start_matches("0x");
        let bytes = Zeroizing::new(
            hex::decode(trimmed)
                .map_err(|e| Error::Config(format!("Invalid key-encryption key hex: {}", e)))?,
        );
        let kek: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!(
                "Key-encryption key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(kek))
    }

    /// Load the key-encryption key from the named environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let value = Zeroizing::new(
            std::env::var(var)
                .map_err(|_| Error::Config(format!("Missing environment variable: {}", var)))?,
        );
        Self::from_hex(&value)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.kek.as_slice()).map_err(|e| Error::KeyDecrypt(e.to_string()))
    }

    /// Encrypt a funding wallet private key into the stored ciphertext format
    pub fn seal(&self, private_key: &[u8]) -> Result<String> {
        let mut nonce = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: private_key,
                    aad: FUNDING_KEY_AAD,
                },
            )
            .map_err(|e| Error::KeyDecrypt(format!("encrypt failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }
}

impl KeyDecryptor for AesGcmKeyDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>> {
        let blob = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| Error::KeyDecrypt(format!("ciphertext is not base64: {}", e)))?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::KeyDecrypt("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);

        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: FUNDING_KEY_AAD,
                },
            )
            .map_err(|e| Error::KeyDecrypt(e.to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Decrypted funding wallet, alive only for the duration of one submission
pub struct FundingSigner {
    key: SigningKey,
    address: Address,
}

impl FundingSigner {
    /// Build from raw 32-byte secret or its hex text
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let parsed = if secret.len() == 32 {
            SigningKey::from_slice(secret)
        } else {
            let text = std::str::from_utf8(secret).map_err(|_| {
                Error::KeyDecrypt("funding key is neither 32 bytes nor hex".to_string())
            })?;
            let decoded = Zeroizing::new(
                hex::decode(text.trim().trim_start_matches("0x"))
                    .map_err(|e| Error::KeyDecrypt(format!("funding key hex: {}", e)))?,
            );
            SigningKey::from_slice(&decoded)
        };
        let key =
            parsed.map_err(|e| Error::KeyDecrypt(format!("invalid secp256k1 key: {}", e)))?;

        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    /// Decrypt ciphertext and build a signer in one step
    pub fn decrypt(decryptor: &dyn KeyDecryptor, ciphertext: &str) -> Result<Self> {
        let secret = decryptor.decrypt(ciphertext)?;
        Self::from_secret_bytes(&secret)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte prehash, returning a low-S signature and recovery id
    pub fn sign_prehash(&self, prehash: &[u8; 32]) -> Result<(Signature, RecoveryId)> {
        self.key
            .sign_prehash_recoverable(prehash)
            .map_err(|e| Error::KeyDecrypt(format!("signing failed: {}", e)))
    }
}

impl fmt::Debug for FundingSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FundingSigner")
            .field("address", &format_address(&self.address))
            .field("key", &"***")
            .finish()
    }
}

/// Ethereum address of a secp256k1 public key
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}
