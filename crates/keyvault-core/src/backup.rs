//! Mirror copy, timestamped snapshots and the load fallback chain.
//!
//! Every key lives next to the live vault key:
//!
//! - `<vaultKey>_redundant` holds a copy of the last successful save.
//! - `<vaultKey>_backup_<unixMillis>` holds a snapshot taken before a
//!   destructive change. The newest `retention` snapshots are kept.
//!
//! Payloads are stored in the serialized vault format, sealed when the vault
//! is encrypted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::decode_vault;
use crate::error::{Result, VaultError};
use crate::model::SecretRecord;
use crate::storage::Storage;

// ── Keys ────────────────────────────────────────────────────────────────────

pub fn mirror_key(vault_key: &str) -> String {
    format!("{vault_key}_redundant")
}

pub fn snapshot_prefix(vault_key: &str) -> String {
    format!("{vault_key}_backup_")
}

pub fn snapshot_key(vault_key: &str, timestamp: i64) -> String {
    format!("{}{timestamp}", snapshot_prefix(vault_key))
}

/// True for every key the live vault writes.
pub fn is_vault_owned(vault_key: &str, key: &str) -> bool {
    key == vault_key
        || key == mirror_key(vault_key)
        || key == crate::storage::settings_key(vault_key)
        || key.starts_with(&snapshot_prefix(vault_key))
}

// ── Load reporting ──────────────────────────────────────────────────────────

/// Which copy a load was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "timestamp", rename_all = "camelCase")]
pub enum LoadSource {
    Primary,
    Mirror,
    Snapshot(i64),
    /// Nothing stored yet.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub records: Vec<SecretRecord>,
    pub source: LoadSource,
    pub skipped_malformed: usize,
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct BackupManager {
    storage: Arc<dyn Storage>,
    vault_key: String,
    retention: usize,
    last_timestamp: i64,
}

impl BackupManager {
    pub fn new(storage: Arc<dyn Storage>, vault_key: impl Into<String>, retention: usize) -> Self {
        Self {
            storage,
            vault_key: vault_key.into(),
            retention: retention.max(1),
            last_timestamp: i64::MIN,
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention.max(1);
    }

    /// Store `payload` as a new snapshot and rotate old ones out.
    ///
    /// Returns the snapshot timestamp. Timestamps strictly increase even when
    /// two snapshots are taken within the same millisecond.
    pub fn snapshot(&mut self, payload: &str, now: DateTime<Utc>) -> Result<i64> {
        let newest_stored = self.list_snapshots()?.last().copied().unwrap_or(i64::MIN);
        let floor = self.last_timestamp.max(newest_stored).saturating_add(1);
        let timestamp = now.timestamp_millis().max(floor);

        self.storage
            .set(&snapshot_key(&self.vault_key, timestamp), payload)?;
        self.last_timestamp = timestamp;
        info!(timestamp, "vault snapshot written");

        let removed = self.rotate()?;
        if removed > 0 {
            debug!(removed, retention = self.retention, "rotated old snapshots");
        }
        Ok(timestamp)
    }

    pub fn refresh_mirror(&self, payload: &str) -> Result<()> {
        self.storage.set(&mirror_key(&self.vault_key), payload)?;
        Ok(())
    }

    /// Snapshot timestamps, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<i64>> {
        let prefix = snapshot_prefix(&self.vault_key);
        let mut stamps: Vec<i64> = self
            .storage
            .keys()?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<i64>().ok())
            .collect();
        stamps.sort_unstable();
        Ok(stamps)
    }

    /// Raw payload of one snapshot.
    pub fn read_snapshot(&self, timestamp: i64) -> Result<Option<String>> {
        Ok(self.storage.get(&snapshot_key(&self.vault_key, timestamp))?)
    }

    /// Records held by one snapshot, `None` if it does not exist.
    pub fn restore(&self, timestamp: i64, passphrase: Option<&str>) -> Result<Option<Vec<SecretRecord>>> {
        match self.read_snapshot(timestamp)? {
            Some(payload) => Ok(Some(decode_vault(&payload, passphrase)?.records)),
            None => Ok(None),
        }
    }

    /// Delete the oldest snapshots while more than `retention` remain.
    pub fn rotate(&self) -> Result<usize> {
        let stamps = self.list_snapshots()?;
        let excess = stamps.len().saturating_sub(self.retention);
        for timestamp in &stamps[..excess] {
            self.storage
                .remove(&snapshot_key(&self.vault_key, *timestamp))?;
        }
        Ok(excess)
    }

    /// Read the vault from the first copy that decodes: primary, then mirror,
    /// then snapshots newest first.
    ///
    /// A sealed copy with no passphrase at hand stops the chain. With a
    /// passphrase, an authentication failure may just be a damaged copy, so
    /// the next copy is tried. A copy whose records are all malformed counts
    /// as unreadable. When copies exist but none decode, the first error is
    /// returned so a caller never mistakes damage for an empty vault.
    pub fn load(&self, passphrase: Option<&str>) -> Result<LoadReport> {
        let mut candidates = vec![
            (LoadSource::Primary, self.vault_key.clone()),
            (LoadSource::Mirror, mirror_key(&self.vault_key)),
        ];
        match self.list_snapshots() {
            Ok(stamps) => candidates.extend(
                stamps
                    .into_iter()
                    .rev()
                    .map(|ts| (LoadSource::Snapshot(ts), snapshot_key(&self.vault_key, ts))),
            ),
            Err(e) => warn!(error = %e, "cannot enumerate snapshots"),
        }

        let mut first_error: Option<VaultError> = None;
        for (source, key) in candidates {
            let payload = match self.storage.get(&key) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(?source, error = %e, "storage read failed, trying next copy");
                    first_error = first_error.or(Some(e.into()));
                    continue;
                }
            };
            match decode_vault(&payload, passphrase) {
                Ok(decoded) if decoded.records.is_empty() && decoded.skipped_malformed > 0 => {
                    warn!(
                        ?source,
                        skipped = decoded.skipped_malformed,
                        "vault copy holds only malformed records, trying next copy"
                    );
                    first_error = first_error.or(Some(VaultError::MalformedRecord(format!(
                        "{} malformed records and none readable",
                        decoded.skipped_malformed
                    ))));
                }
                Ok(decoded) => {
                    if source != LoadSource::Primary {
                        warn!(?source, "primary vault unreadable, loaded fallback copy");
                    } else {
                        debug!(records = decoded.records.len(), "vault loaded");
                    }
                    return Ok(LoadReport {
                        records: decoded.records,
                        source,
                        skipped_malformed: decoded.skipped_malformed,
                    });
                }
                Err(e) if passphrase.is_none() && e.is_passphrase_failure() => return Err(e),
                Err(e) => {
                    warn!(?source, error = %e, "vault copy unreadable, trying next copy");
                    first_error = first_error.or(Some(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(LoadReport {
                records: Vec::new(),
                source: LoadSource::Empty,
                skipped_malformed: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::{Duration, TimeZone};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn retention_keeps_newest_snapshots() {
        let storage = Arc::new(MemoryStorage::new());
        let mut manager = BackupManager::new(storage.clone(), "vault", 5);
        let start = at(1_700_000_000_000);
        let mut written = Vec::new();
        for i in 0..7 {
            written.push(manager.snapshot("[]", start + Duration::seconds(i)).unwrap());
        }
        assert_eq!(manager.list_snapshots().unwrap(), written[2..].to_vec());
    }

    #[test]
    fn same_millisecond_snapshots_get_distinct_stamps() {
        let storage = Arc::new(MemoryStorage::new());
        let mut manager = BackupManager::new(storage, "vault", 5);
        let now = at(1_700_000_000_000);
        let a = manager.snapshot("[]", now).unwrap();
        let b = manager.snapshot("[]", now).unwrap();
        assert!(b > a);
    }

    #[test]
    fn vault_owned_keys() {
        assert!(is_vault_owned("v", "v"));
        assert!(is_vault_owned("v", "v_redundant"));
        assert!(is_vault_owned("v", "v_backup_123"));
        assert!(is_vault_owned("v", "v_settings"));
        assert!(!is_vault_owned("v", "v2"));
        assert!(!is_vault_owned("v", "openaiSettings"));
    }

    #[test]
    fn empty_storage_loads_empty() {
        let manager = BackupManager::new(Arc::new(MemoryStorage::new()), "vault", 5);
        let report = manager.load(None).unwrap();
        assert_eq!(report.source, LoadSource::Empty);
        assert!(report.records.is_empty());
    }

    #[test]
    fn unreadable_copies_surface_an_error() {
        let storage = Arc::new(MemoryStorage::with_entries([("vault", "garbage")]));
        let manager = BackupManager::new(storage, "vault", 5);
        assert!(matches!(manager.load(None), Err(VaultError::MalformedRecord(_))));
    }

    fn sealed(records: &serde_json::Value, passphrase: &str) -> String {
        crate::crypto::encrypt_value(records, passphrase, &crate::crypto::KdfParams::minimal())
            .unwrap()
    }

    fn record_json(secret: &str) -> serde_json::Value {
        serde_json::json!([{"id": "1", "name": "a", "service": "openai", "secretValue": secret}])
    }

    #[test]
    fn damaged_sealed_primary_falls_back_to_mirror() {
        let good = sealed(&record_json("sk-mirrorcopy0000000000"), "pw-long");
        let mut damaged: Vec<char> = good.chars().collect();
        let at = damaged.len() - 6;
        damaged[at] = if damaged[at] == 'A' { 'B' } else { 'A' };
        let damaged: String = damaged.into_iter().collect();

        let storage = Arc::new(MemoryStorage::with_entries([
            ("vault", damaged),
            ("vault_redundant", good),
        ]));
        let manager = BackupManager::new(storage, "vault", 5);
        let report = manager.load(Some("pw-long")).unwrap();
        assert_eq!(report.source, LoadSource::Mirror);
        assert_eq!(report.records[0].secret_value, "sk-mirrorcopy0000000000");
    }

    #[test]
    fn sealed_copies_without_passphrase_stop_the_chain() {
        let good = sealed(&record_json("sk-mirrorcopy0000000000"), "pw-long");
        let storage = Arc::new(MemoryStorage::with_entries([
            ("vault", good.clone()),
            ("vault_redundant", good),
        ]));
        let manager = BackupManager::new(storage, "vault", 5);
        assert!(matches!(manager.load(None), Err(VaultError::DecryptAuthFailure)));
    }

    #[test]
    fn wrong_passphrase_on_every_copy_is_reported() {
        let good = sealed(&record_json("sk-mirrorcopy0000000000"), "pw-long");
        let storage = Arc::new(MemoryStorage::with_entries([
            ("vault", good.clone()),
            ("vault_redundant", good),
        ]));
        let manager = BackupManager::new(storage, "vault", 5);
        assert!(matches!(manager.load(Some("other")), Err(VaultError::DecryptAuthFailure)));
    }

    #[test]
    fn all_malformed_primary_falls_back_to_mirror() {
        let storage = Arc::new(MemoryStorage::with_entries([
            ("vault", r#"[{"id":"1"}]"#.to_string()),
            ("vault_redundant", record_json("sk-mirrorcopy0000000000").to_string()),
        ]));
        let manager = BackupManager::new(storage, "vault", 5);
        let report = manager.load(None).unwrap();
        assert_eq!(report.source, LoadSource::Mirror);
        assert_eq!(report.records.len(), 1);
    }
}
