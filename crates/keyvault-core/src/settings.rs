use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;
use crate::error::{Result, VaultError};

pub const DEFAULT_VAULT_KEY: &str = "keyvault_secrets";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultSettings {
    pub encryption_enabled: bool,
    /// Compared verbatim on unlock.
    ///
    /// Persisted in plaintext at `<vaultKey>_settings`, in the same store as
    /// the sealed vault. It is not protected data; only `Debug` redacts it.
    pub passphrase: Option<String>,
    pub auto_lock_enabled: bool,
    pub auto_lock_minutes: u32,
    pub backup_retention: usize,
    pub recovery_workers: usize,
    /// Lets recovery try the fixed list of common passphrases.
    pub allow_password_guessing: bool,
    pub kdf: KdfParams,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            encryption_enabled: false,
            passphrase: None,
            auto_lock_enabled: true,
            auto_lock_minutes: 15,
            backup_retention: 5,
            recovery_workers: 4,
            allow_password_guessing: false,
            kdf: KdfParams::default(),
        }
    }
}

impl fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSettings")
            .field("encryption_enabled", &self.encryption_enabled)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("auto_lock_enabled", &self.auto_lock_enabled)
            .field("auto_lock_minutes", &self.auto_lock_minutes)
            .field("backup_retention", &self.backup_retention)
            .field("recovery_workers", &self.recovery_workers)
            .field("allow_password_guessing", &self.allow_password_guessing)
            .field("kdf", &self.kdf)
            .finish()
    }
}

impl VaultSettings {
    pub fn passphrase_configured(&self) -> bool {
        self.passphrase.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=50).contains(&self.backup_retention) {
            return Err(VaultError::InvalidSettings(
                "backup retention must be between 1 and 50".into(),
            ));
        }
        if !(1..=1440).contains(&self.auto_lock_minutes) {
            return Err(VaultError::InvalidSettings(
                "auto-lock timeout must be between 1 and 1440 minutes".into(),
            ));
        }
        if !(1..=32).contains(&self.recovery_workers) {
            return Err(VaultError::InvalidSettings(
                "recovery workers must be between 1 and 32".into(),
            ));
        }
        if self.encryption_enabled && !self.passphrase_configured() {
            return Err(VaultError::InvalidSettings(
                "encryption requires a non-empty passphrase".into(),
            ));
        }
        self.kdf
            .validate()
            .map_err(|e| VaultError::InvalidSettings(e.to_string()))
    }
}
