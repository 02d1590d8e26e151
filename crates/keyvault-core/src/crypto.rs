//! Passphrase envelope for the serialized vault.
//!
//! Envelope string: `kv1:` + base64 of
//!
//! ```text
//! magic "KVLT0001" (8) | kdf iterations u32le | kdf memory KiB u32le |
//! kdf parallelism u32le | salt (16) | nonce (24) | XChaCha20-Poly1305 ciphertext
//! ```
//!
//! The 60-byte header is authenticated as AAD. The key is derived with
//! Argon2id using the parameters recorded in the header, so an envelope can be
//! opened without knowing the settings it was written with.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::model::SecretRecord;

pub const ENVELOPE_PREFIX: &str = "kv1:";
pub const ENVELOPE_MAGIC: &[u8; 8] = b"KVLT0001";
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const HEADER_SIZE: usize = 8 + 12 + SALT_LEN + NONCE_LEN;
pub const DERIVED_KEY_LEN: usize = 32;

// Upper bounds for parameters read back from an envelope header.
const MAX_MEMORY_KIB: u32 = 256 * 1024;
const MAX_ITERATIONS: u32 = 10;
const MAX_PARALLELISM: u32 = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Smallest parameters Argon2 accepts. For tests and low-power devices.
    pub const fn minimal() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(VaultError::InvalidSettings(format!(
                "kdf parallelism must be between 1 and {MAX_PARALLELISM}"
            )));
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(VaultError::InvalidSettings(format!(
                "kdf iterations must be between 1 and {MAX_ITERATIONS}"
            )));
        }
        if self.memory_kib < 8 * self.parallelism || self.memory_kib > MAX_MEMORY_KIB {
            return Err(VaultError::InvalidSettings(format!(
                "kdf memory must be between {} and {MAX_MEMORY_KIB} KiB",
                8 * self.parallelism
            )));
        }
        Ok(())
    }
}

/// Why an envelope could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// Prefix present but the body is not a well-formed envelope.
    Corrupted,
    /// Tag mismatch: wrong passphrase or tampered bytes.
    Authentication,
    /// Decrypted fine, but the plaintext is not JSON.
    NotJson,
}

/// The three outcomes callers branch on.
#[derive(Debug, Clone, PartialEq)]
pub enum DecryptOutcome {
    Json(serde_json::Value),
    Failed(DecryptFailure),
    NotCiphertext,
}

#[derive(Debug, Clone)]
struct EnvelopeHeader {
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
}

impl EnvelopeHeader {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(ENVELOPE_MAGIC);
        buf[8..12].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[20..36].copy_from_slice(&self.salt);
        buf[36..60].copy_from_slice(&self.nonce);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || &buf[..8] != ENVELOPE_MAGIC {
            return None;
        }
        let word = |range: std::ops::Range<usize>| -> Option<u32> {
            Some(u32::from_le_bytes(buf.get(range)?.try_into().ok()?))
        };
        let kdf = KdfParams {
            iterations: word(8..12)?,
            memory_kib: word(12..16)?,
            parallelism: word(16..20)?,
        };
        Some(Self {
            kdf,
            salt: buf[20..36].try_into().ok()?,
            nonce: buf[36..60].try_into().ok()?,
        })
    }
}

pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    let params = Params::new(
        kdf.memory_kib,
        kdf.iterations,
        kdf.parallelism,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| VaultError::Crypto(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| VaultError::Crypto(format!("argon2 derive: {e}")))?;
    Ok(key)
}

/// Whether `text` carries the envelope prefix.
pub fn is_envelope(text: &str) -> bool {
    text.trim_start().starts_with(ENVELOPE_PREFIX)
}

pub fn encrypt_value<T: Serialize + ?Sized>(
    value: &T,
    passphrase: &str,
    kdf: &KdfParams,
) -> Result<String> {
    kdf.validate()?;
    let plaintext = Zeroizing::new(serde_json::to_vec(value)?);

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);
    let header = EnvelopeHeader {
        kdf: *kdf,
        salt,
        nonce,
    };
    let header_bytes = header.to_bytes();

    let key = derive_key(passphrase, &salt, kdf)?;
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_ref(),
                aad: &header_bytes,
            },
        )
        .map_err(|e| VaultError::Crypto(format!("encrypt: {e}")))?;

    let mut body = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    body.extend_from_slice(&header_bytes);
    body.extend_from_slice(&ciphertext);
    Ok(format!(
        "{ENVELOPE_PREFIX}{}",
        general_purpose::STANDARD.encode(body)
    ))
}

pub fn encrypt(records: &[SecretRecord], passphrase: &str, kdf: &KdfParams) -> Result<String> {
    encrypt_value(records, passphrase, kdf)
}

/// Open an envelope. Never panics and never touches storage.
pub fn decrypt(ciphertext: &str, passphrase: &str) -> DecryptOutcome {
    let trimmed = ciphertext.trim();
    let Some(encoded) = trimmed.strip_prefix(ENVELOPE_PREFIX) else {
        return DecryptOutcome::NotCiphertext;
    };
    let Ok(body) = general_purpose::STANDARD.decode(encoded) else {
        return DecryptOutcome::Failed(DecryptFailure::Corrupted);
    };
    let Some(header) = EnvelopeHeader::from_bytes(&body) else {
        return DecryptOutcome::Failed(DecryptFailure::Corrupted);
    };
    if header.kdf.validate().is_err() {
        return DecryptOutcome::Failed(DecryptFailure::Corrupted);
    }
    let Ok(key) = derive_key(passphrase, &header.salt, &header.kdf) else {
        return DecryptOutcome::Failed(DecryptFailure::Corrupted);
    };
    let (header_bytes, sealed) = body.split_at(HEADER_SIZE);
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let plaintext = match cipher.decrypt(
        XNonce::from_slice(&header.nonce),
        Payload {
            msg: sealed,
            aad: header_bytes,
        },
    ) {
        Ok(bytes) => Zeroizing::new(bytes),
        Err(_) => return DecryptOutcome::Failed(DecryptFailure::Authentication),
    };
    match serde_json::from_slice(&plaintext) {
        Ok(value) => DecryptOutcome::Json(value),
        Err(_) => DecryptOutcome::Failed(DecryptFailure::NotJson),
    }
}
