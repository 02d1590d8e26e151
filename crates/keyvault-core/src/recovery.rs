//! Whole-storage recovery scan.
//!
//! Three passes run over every entry the live vault does not own:
//!
//! 1. known legacy locations, decoded and walked by the extractor;
//! 2. every other key, same procedure;
//! 3. a regex catch-all over the raw text of all entries.
//!
//! Entries are read one at a time, then decoded and scanned on a bounded rayon
//! pool. Results are collected in key order so the outcome is the same on
//! every run. Nothing is ever written to storage.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backup::is_vault_owned;
use crate::crypto::is_envelope;
use crate::dedup::dedupe;
use crate::error::Result;
use crate::extractor::{Extraction, HeuristicExtractor};
use crate::guesser::PasswordGuesser;
use crate::model::{RecoveryResult, SecretRecord, SourceLocation};
use crate::raw_value::RawValue;
use crate::storage::Storage;

/// Storage keys used by earlier releases and common integrations.
pub const KNOWN_LOCATIONS: &[&str] = &[
    "apiKeys",
    "api_keys",
    "api-keys",
    "apikeys",
    "secrets",
    "userSecrets",
    "user_secrets",
    "credentials",
    "userCredentials",
    "savedCredentials",
    "tokens",
    "authTokens",
    "accessTokens",
    "keyvault",
    "keyVault",
    "key_vault",
    "vault",
    "secureVault",
    "secure_vault",
    "encryptedVault",
    "encrypted_keys",
    "encryptedKeys",
    "secretsVault",
    "apiKeyVault",
    "api_key_vault",
    "apiKeyManager",
    "keyManager",
    "key_manager",
    "settings",
    "appSettings",
    "app_settings",
    "userSettings",
    "preferences",
    "config",
    "appConfig",
    "integrations",
    "connections",
    "providers",
    "services",
    "exchangeKeys",
    "exchange_keys",
    "exchangeApiKeys",
    "tradingKeys",
    "walletKeys",
    "openaiSettings",
    "openai_api_key",
    "anthropicSettings",
    "anthropic_api_key",
    "binanceSettings",
    "binance_api",
    "coinbaseSettings",
    "krakenSettings",
    "githubToken",
    "github_token",
    "heliusSettings",
    "heliusApiKey",
    "birdeyeApiKey",
    "jupiterSettings",
    "rpcSettings",
    "backup_secrets",
    "secrets_backup",
    "legacySecrets",
];

fn is_known_location(key: &str) -> bool {
    KNOWN_LOCATIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(key))
}

pub struct RecoveryOrchestrator {
    storage: Arc<dyn Storage>,
    vault_key: String,
    extractor: HeuristicExtractor,
    guesser: PasswordGuesser,
    workers: usize,
}

impl RecoveryOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, vault_key: impl Into<String>) -> Self {
        Self {
            storage,
            vault_key: vault_key.into(),
            extractor: HeuristicExtractor::new(),
            guesser: PasswordGuesser::new(false),
            workers: 4,
        }
    }

    pub fn with_guesser(mut self, guesser: PasswordGuesser) -> Self {
        self.guesser = guesser;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn recover_all(&self) -> Result<RecoveryResult> {
        let mut keys = self.storage.keys()?;
        keys.sort();
        keys.retain(|key| !is_vault_owned(&self.vault_key, key));

        let mut entries: Vec<(String, String)> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.storage.get(&key) {
                Ok(Some(raw)) => entries.push((key, raw)),
                Ok(None) => {}
                Err(e) => debug!(key = %key, error = %e, "skipping unreadable entry"),
            }
        }

        let (known, other): (Vec<&(String, String)>, Vec<&(String, String)>) =
            entries.iter().partition(|(key, _)| is_known_location(key));

        let structured = self.run_parallel(|| {
            let known: Vec<Extraction> = known
                .par_iter()
                .map(|(key, raw)| self.decode_and_extract(key, raw))
                .collect();
            let other: Vec<Extraction> = other
                .par_iter()
                .map(|(key, raw)| self.decode_and_extract(key, raw))
                .collect();
            (known, other)
        });
        let (known_found, other_found) = structured;

        let mut candidates: Vec<SecretRecord> = Vec::new();
        let mut structural: HashSet<String> = HashSet::new();
        for extraction in known_found.into_iter().chain(other_found) {
            candidates.extend(extraction.candidates);
            structural.extend(extraction.structural_values);
        }
        let structured_count = candidates.len();

        let pattern_found: Vec<Vec<SecretRecord>> = self.run_parallel(|| {
            entries
                .par_iter()
                .map(|(key, raw)| self.extractor.scan_patterns(key, raw, &structural))
                .collect()
        });
        candidates.extend(pattern_found.into_iter().flatten());

        let total = candidates.len();
        let records = dedupe(candidates);

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in &records {
            if let Some(source) = record.source.as_deref() {
                *counts.entry(source).or_default() += 1;
            }
        }
        let locations = counts
            .into_iter()
            .map(|(source_key, count)| SourceLocation {
                source_key: source_key.to_string(),
                count,
            })
            .collect();

        info!(
            entries = entries.len(),
            structured = structured_count,
            pattern = total - structured_count,
            unique = records.len(),
            "recovery scan finished"
        );
        Ok(RecoveryResult { records, locations })
    }

    fn decode_and_extract(&self, key: &str, raw: &str) -> Extraction {
        if let Some(value) = RawValue::parse(raw) {
            return self.extractor.extract(key, &value);
        }
        if let Some(value) = self.guesser.try_common_passwords(raw) {
            return self.extractor.extract(key, &value);
        }
        if is_envelope(raw) {
            debug!(key, "entry is sealed and could not be opened");
            return Extraction::default();
        }
        self.extractor.extract(key, &RawValue::String(raw.to_string()))
    }

    fn run_parallel<T, F>(&self, work: F) -> T
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("keyvault-recovery-{i}"))
            .build()
        {
            Ok(pool) => pool.install(work),
            Err(e) => {
                warn!(error = %e, "cannot build recovery pool, using the global pool");
                work()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn known_locations_match_case_insensitively() {
        assert!(is_known_location("APIKEYS"));
        assert!(is_known_location("openaiSettings"));
        assert!(!is_known_location("somethingElse"));
        assert!(KNOWN_LOCATIONS.len() >= 55);
    }

    #[test]
    fn plain_string_entries_are_leaves() {
        let storage = Arc::new(MemoryStorage::with_entries([(
            "openai_api_key",
            "sk-abcdefghijklmnopqrstuvwxyz012345",
        )]));
        let result = RecoveryOrchestrator::new(storage, "keyvault_secrets")
            .recover_all()
            .unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].service, "openai");
        assert_eq!(result.locations[0].count, 1);
    }

    #[test]
    fn vault_owned_keys_are_not_scanned() {
        let storage = Arc::new(MemoryStorage::with_entries([
            ("keyvault_secrets", r#"[{"id":"1","name":"a","service":"x","secretValue":"sk-abcdefghijklmnopqrstuvwxyz"}]"#),
            ("keyvault_secrets_redundant", "sk-abcdefghijklmnopqrstuvwxyz"),
        ]));
        let result = RecoveryOrchestrator::new(storage, "keyvault_secrets")
            .recover_all()
            .unwrap();
        assert!(result.records.is_empty());
        assert!(result.locations.is_empty());
    }
}
