//! Fixed-list passphrase guessing for legacy ciphertext found in storage.
//!
//! Guessing weakens any envelope it succeeds against, so it only runs when the
//! caller has opted in through `allow_password_guessing`.

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{decrypt, is_envelope, DecryptOutcome};
use crate::raw_value::RawValue;

/// Tried in order; the first one that yields a JSON container wins.
pub const COMMON_PASSPHRASES: [&str; 20] = [
    "password",
    "123456",
    "12345678",
    "password123",
    "admin",
    "admin123",
    "secret",
    "changeme",
    "letmein",
    "qwerty",
    "default",
    "vault",
    "keyvault",
    "apikeys",
    "passw0rd",
    "welcome",
    "master",
    "1234",
    "test",
    "",
];

pub struct PasswordGuesser {
    enabled: bool,
    known: Option<Zeroizing<String>>,
}

impl PasswordGuesser {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            known: None,
        }
    }

    /// Try `passphrase` before anything else. It is the vault's own
    /// passphrase, so it is attempted even when guessing is disabled.
    pub fn with_known_passphrase(mut self, passphrase: Option<&str>) -> Self {
        self.known = passphrase.map(|p| Zeroizing::new(p.to_string()));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decrypt `ciphertext` with the known passphrase, then with the common
    /// list when enabled. Returns the first array or object recovered.
    pub fn try_common_passwords(&self, ciphertext: &str) -> Option<RawValue> {
        if !is_envelope(ciphertext) {
            return None;
        }
        if let Some(known) = &self.known {
            if let Some(value) = open_container(ciphertext, known) {
                return Some(value);
            }
        }
        if !self.enabled {
            debug!("password guessing disabled; leaving ciphertext sealed");
            return None;
        }
        for (attempt, candidate) in COMMON_PASSPHRASES.iter().enumerate() {
            if let Some(value) = open_container(ciphertext, candidate) {
                info!(attempt = attempt + 1, "legacy ciphertext opened with a common passphrase");
                return Some(value);
            }
        }
        debug!(
            attempts = COMMON_PASSPHRASES.len(),
            "no common passphrase opened ciphertext"
        );
        None
    }
}

fn open_container(ciphertext: &str, passphrase: &str) -> Option<RawValue> {
    match decrypt(ciphertext, passphrase) {
        DecryptOutcome::Json(value) => Some(RawValue::from(value)).filter(RawValue::is_container),
        DecryptOutcome::Failed(_) | DecryptOutcome::NotCiphertext => None,
    }
}
