//! `VaultEngine`: the single owner of records, session and settings.
//!
//! Every public operation first polls auto-lock against the engine clock,
//! refuses to run while locked, and then counts as activity. Mutations rewrite
//! the whole vault and refresh the mirror copy; destructive ones take a
//! snapshot first.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backup::{snapshot_key, BackupManager, LoadReport};
use crate::clock::{Clock, SystemClock};
use crate::codec::{decode_vault, encode_vault, Sealing};
use crate::dedup;
use crate::error::{Result, VaultError};
use crate::guesser::PasswordGuesser;
use crate::model::{
    fingerprint, unix_epoch, Liveness, MergeReport, NewSecret, RecoveryResult, SecretPatch,
    SecretRecord, SecretStatus, VaultStats,
};
use crate::recovery::RecoveryOrchestrator;
use crate::service::canonical_service;
use crate::session::{AutoLockTimer, DeleteAuthorization, SessionState, VaultSession};
use crate::settings::VaultSettings;
use crate::storage::{load_settings, save_settings, Storage};

pub struct VaultEngine {
    storage: Arc<dyn Storage>,
    vault_key: String,
    settings: VaultSettings,
    records: Vec<SecretRecord>,
    loaded: bool,
    session: Arc<Mutex<VaultSession>>,
    backups: BackupManager,
    clock: Arc<dyn Clock>,
    timer: Option<AutoLockTimer>,
}

impl VaultEngine {
    pub fn open(storage: Arc<dyn Storage>, vault_key: &str) -> Result<Self> {
        Self::open_with_clock(storage, vault_key, Arc::new(SystemClock))
    }

    /// Open with an explicit time source. Settings are read from storage;
    /// records are read on first use or by an explicit [`load`](Self::load).
    pub fn open_with_clock(
        storage: Arc<dyn Storage>,
        vault_key: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let settings = load_settings(storage.as_ref(), vault_key)?;
        settings.validate()?;
        let session = VaultSession::new(&settings, clock.now());
        info!(
            vault_key,
            encrypted = settings.encryption_enabled,
            state = ?session.state(),
            "vault opened"
        );
        Ok(Self {
            backups: BackupManager::new(storage.clone(), vault_key, settings.backup_retention),
            storage,
            vault_key: vault_key.to_string(),
            settings,
            records: Vec::new(),
            loaded: false,
            session: Arc::new(Mutex::new(session)),
            clock,
            timer: None,
        })
    }

    pub fn vault_key(&self) -> &str {
        &self.vault_key
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    // ── Session ─────────────────────────────────────────────────────────────

    pub fn session_state(&self) -> SessionState {
        let mut session = self.session.lock();
        session.poll_auto_lock(self.clock.now());
        session.state()
    }

    pub fn lock(&mut self) -> Result<()> {
        self.session.lock().lock()?;
        self.records.clear();
        self.loaded = false;
        Ok(())
    }

    /// Unlock and read the vault with the now available passphrase.
    pub fn unlock(&mut self, passphrase: &str) -> Result<LoadReport> {
        self.session.lock().unlock(passphrase, self.clock.now())?;
        self.rearm_timer();
        self.load_inner()
    }

    pub fn record_activity(&self) {
        let now = self.clock.now();
        let mut session = self.session.lock();
        session.poll_auto_lock(now);
        session.record_activity(now);
        drop(session);
        self.rearm_timer();
    }

    /// Spawn the background auto-lock task. Needs a tokio runtime.
    pub fn start_auto_lock_timer(&mut self) {
        if self.timer.is_none() {
            self.timer = Some(AutoLockTimer::spawn(self.session.clone(), self.clock.clone()));
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.shutdown().await;
        }
    }

    fn rearm_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.rearm();
        }
    }

    fn gate(&self) -> Result<()> {
        let now = self.clock.now();
        let mut session = self.session.lock();
        session.poll_auto_lock(now);
        if session.is_locked() {
            return Err(VaultError::SessionLocked);
        }
        session.record_activity(now);
        drop(session);
        self.rearm_timer();
        Ok(())
    }

    fn passphrase(&self) -> Option<Zeroizing<String>> {
        self.session
            .lock()
            .passphrase()
            .map(|p| Zeroizing::new(p.to_string()))
    }

    // ── Load / save ─────────────────────────────────────────────────────────

    /// Re-read the vault from storage, falling back to the mirror and then
    /// snapshots.
    pub fn load(&mut self) -> Result<LoadReport> {
        self.gate()?;
        self.load_inner()
    }

    fn load_inner(&mut self) -> Result<LoadReport> {
        let passphrase = self.passphrase();
        let report = self.backups.load(passphrase.as_deref().map(String::as_str))?;
        if report.skipped_malformed > 0 {
            warn!(skipped = report.skipped_malformed, "malformed records skipped on load");
        }
        info!(source = ?report.source, records = report.records.len(), "vault records loaded");
        self.records = report.records.clone();
        self.loaded = true;
        Ok(report)
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if !self.loaded {
            self.load_inner()?;
        }
        Ok(())
    }

    /// Replace the whole record set. Records are normalized and deduplicated
    /// by value, and the previous set is snapshotted before it is overwritten.
    pub fn save(&mut self, records: Vec<SecretRecord>) -> Result<()> {
        self.gate()?;
        self.ensure_loaded()?;
        let records = records
            .into_iter()
            .map(|record| {
                record
                    .normalized()
                    .map_err(|e| VaultError::InvalidRecord(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let records = dedup::dedupe(records);

        self.snapshot_current()?;
        let previous = std::mem::replace(&mut self.records, records);
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e);
        }
        info!(records = self.records.len(), "vault replaced");
        Ok(())
    }

    fn encode(&self, records: &[SecretRecord]) -> Result<String> {
        if self.settings.encryption_enabled {
            let passphrase = self.passphrase().ok_or(VaultError::SessionLocked)?;
            encode_vault(
                records,
                Sealing::Passphrase {
                    passphrase: &passphrase,
                    kdf: &self.settings.kdf,
                },
            )
        } else {
            encode_vault(records, Sealing::Plain)
        }
    }

    fn persist(&self) -> Result<()> {
        let payload = self.encode(&self.records)?;
        self.storage.set(&self.vault_key, &payload)?;
        self.backups.refresh_mirror(&payload)?;
        debug!(records = self.records.len(), "vault saved");
        Ok(())
    }

    fn snapshot_current(&mut self) -> Result<Option<i64>> {
        if self.records.is_empty() {
            return Ok(None);
        }
        let payload = self.encode(&self.records)?;
        Ok(Some(self.backups.snapshot(&payload, self.clock.now())?))
    }

    // ── Records ─────────────────────────────────────────────────────────────

    pub fn records(&mut self) -> Result<&[SecretRecord]> {
        self.gate()?;
        self.ensure_loaded()?;
        Ok(&self.records)
    }

    pub fn add_secret(&mut self, input: NewSecret) -> Result<SecretRecord> {
        self.gate()?;
        self.ensure_loaded()?;
        if input.secret_value.is_empty() {
            return Err(VaultError::InvalidRecord("secret value must not be empty".into()));
        }
        if input.name.trim().is_empty() {
            return Err(VaultError::InvalidRecord("name must not be empty".into()));
        }
        if let Some(existing) = self.records.iter().find(|r| r.secret_value == input.secret_value) {
            return Err(VaultError::InvalidRecord(format!(
                "secret already stored as {}",
                existing.id
            )));
        }

        let record = SecretRecord {
            id: Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            service: canonical_service(&input.service),
            secret_value: input.secret_value,
            description: input.description.filter(|d| !d.trim().is_empty()),
            status: SecretStatus::Active,
            created_at: self.clock.now(),
            source: None,
            is_working: Liveness::Unknown,
        };
        self.records.push(record.clone());
        if let Err(e) = self.persist() {
            self.records.pop();
            return Err(e);
        }
        info!(id = %record.id, service = %record.service, fingerprint = %fingerprint(&record.secret_value), "secret added");
        Ok(record)
    }

    pub fn update_secret(&mut self, id: &str, patch: SecretPatch) -> Result<SecretRecord> {
        self.gate()?;
        self.ensure_loaded()?;
        let index = self.index_of(id)?;

        let mut updated = self.records[index].clone();
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(VaultError::InvalidRecord("name must not be empty".into()));
            }
            updated.name = name.trim().to_string();
        }
        if let Some(service) = patch.service {
            updated.service = canonical_service(&service);
        }
        if let Some(description) = patch.description {
            updated.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if let Some(status) = patch.status {
            updated.status = status;
        }
        let secret_changed = match patch.secret_value {
            Some(value) if value != updated.secret_value => {
                if value.is_empty() {
                    return Err(VaultError::InvalidRecord("secret value must not be empty".into()));
                }
                if self.records.iter().any(|r| r.secret_value == value) {
                    return Err(VaultError::InvalidRecord(
                        "another record already holds this secret".into(),
                    ));
                }
                updated.secret_value = value;
                updated.is_working = Liveness::Unknown;
                true
            }
            _ => false,
        };

        if secret_changed {
            self.snapshot_current()?;
        }
        let previous = std::mem::replace(&mut self.records[index], updated.clone());
        if let Err(e) = self.persist() {
            self.records[index] = previous;
            return Err(e);
        }
        debug!(id, secret_changed, "secret updated");
        Ok(updated)
    }

    /// Store the outcome of a live test against the provider.
    pub fn record_test_result(&mut self, id: &str, working: bool) -> Result<()> {
        self.gate()?;
        self.ensure_loaded()?;
        let index = self.index_of(id)?;
        self.records[index].is_working = Liveness::from(Some(working));
        self.persist()
    }

    pub fn stats(&mut self) -> Result<VaultStats> {
        self.gate()?;
        self.ensure_loaded()?;
        Ok(VaultStats::from_records(&self.records))
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    /// Scan all of storage for orphaned secrets. Does not write anything.
    pub fn recover_all(&self) -> Result<RecoveryResult> {
        self.gate()?;
        let passphrase = self.passphrase();
        let guesser = PasswordGuesser::new(self.settings.allow_password_guessing)
            .with_known_passphrase(passphrase.as_deref().map(String::as_str));
        RecoveryOrchestrator::new(self.storage.clone(), self.vault_key.clone())
            .with_guesser(guesser)
            .with_workers(self.settings.recovery_workers)
            .recover_all()
    }

    /// Add recovered records whose secret the vault does not hold yet.
    pub fn merge_recovered(&mut self, recovered: Vec<SecretRecord>) -> Result<MergeReport> {
        self.gate()?;
        self.ensure_loaded()?;
        let now = self.clock.now();
        let epoch = unix_epoch();

        let mut incoming = Vec::with_capacity(recovered.len());
        for record in recovered {
            match record.normalized() {
                Ok(mut record) => {
                    if record.created_at == epoch {
                        record.created_at = now;
                    }
                    incoming.push(record);
                }
                Err(e) => warn!(error = %e, "dropping malformed recovered record"),
            }
        }

        let (merged, report) = dedup::merge(self.records.clone(), incoming);
        if report.added == 0 {
            info!(duplicates = report.duplicates, "nothing new to merge");
            return Ok(report);
        }

        self.snapshot_current()?;
        let previous = std::mem::replace(&mut self.records, merged);
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e);
        }
        info!(added = report.added, duplicates = report.duplicates, "recovered secrets merged");
        Ok(report)
    }

    // ── Delete ──────────────────────────────────────────────────────────────

    pub fn mint_delete_authorization(&mut self, id: &str) -> Result<DeleteAuthorization> {
        self.gate()?;
        self.ensure_loaded()?;
        self.index_of(id)?;
        Ok(self.session.lock().mint_delete_authorization(id, self.clock.now()))
    }

    /// Remove a record. The token is checked before anything else and spent
    /// only once the removal is written, so a failed write can be retried.
    pub fn delete(&mut self, id: &str, token: &DeleteAuthorization) -> Result<SecretRecord> {
        self.gate()?;
        self.ensure_loaded()?;
        self.session.lock().check_delete(id, token, self.clock.now())?;
        let index = self.index_of(id)?;

        self.snapshot_current()?;
        let removed = self.records.remove(index);
        if let Err(e) = self.persist() {
            self.records.insert(index, removed);
            return Err(e);
        }
        self.session.lock().consume_delete(token);
        info!(id, fingerprint = %fingerprint(&removed.secret_value), "secret deleted");
        Ok(removed)
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    pub fn list_snapshots(&self) -> Result<Vec<i64>> {
        self.gate()?;
        self.backups.list_snapshots()
    }

    /// Replace the live records with a snapshot. The current state is
    /// snapshotted first so the restore itself can be undone.
    pub fn restore_snapshot(&mut self, timestamp: i64) -> Result<usize> {
        self.gate()?;
        self.ensure_loaded()?;
        let passphrase = self.passphrase();
        let restored = self
            .backups
            .restore(timestamp, passphrase.as_deref().map(String::as_str))?
            .ok_or_else(|| VaultError::NotFound(format!("snapshot {timestamp}")))?;

        self.snapshot_current()?;
        let previous = std::mem::replace(&mut self.records, restored);
        if let Err(e) = self.persist() {
            self.records = previous;
            return Err(e);
        }
        info!(timestamp, records = self.records.len(), "snapshot restored");
        Ok(self.records.len())
    }

    // ── Settings ────────────────────────────────────────────────────────────

    pub fn enable_encryption(&mut self, passphrase: &str) -> Result<()> {
        self.gate()?;
        self.ensure_loaded()?;
        if passphrase.is_empty() {
            return Err(VaultError::InvalidSettings(
                "encryption requires a non-empty passphrase".into(),
            ));
        }
        let old_passphrase = self.passphrase();
        let mut next = self.settings.clone();
        next.encryption_enabled = true;
        next.passphrase = Some(passphrase.to_string());
        next.validate()?;
        self.switch_sealing(next, old_passphrase)?;
        info!("vault encryption enabled");
        Ok(())
    }

    /// Turn encryption off. The current passphrase must be supplied again.
    pub fn disable_encryption(&mut self, passphrase: &str) -> Result<()> {
        self.gate()?;
        self.ensure_loaded()?;
        if !self.settings.encryption_enabled {
            return Ok(());
        }
        if self.settings.passphrase.as_deref() != Some(passphrase) {
            return Err(VaultError::WrongPassphrase);
        }
        let old_passphrase = self.passphrase();
        let mut next = self.settings.clone();
        next.encryption_enabled = false;
        next.passphrase = None;
        self.switch_sealing(next, old_passphrase)?;
        info!("vault encryption disabled");
        Ok(())
    }

    fn switch_sealing(
        &mut self,
        next: VaultSettings,
        old_passphrase: Option<Zeroizing<String>>,
    ) -> Result<()> {
        let previous = std::mem::replace(&mut self.settings, next);
        self.session.lock().apply_settings(&self.settings);
        let written = self
            .persist()
            .and_then(|()| self.reseal_snapshots(old_passphrase.as_deref().map(String::as_str)));
        if let Err(e) = written {
            self.settings = previous;
            self.session.lock().apply_settings(&self.settings);
            return Err(e);
        }
        save_settings(self.storage.as_ref(), &self.vault_key, &self.settings)
    }

    /// Rewrite every snapshot in the current sealing.
    fn reseal_snapshots(&self, old_passphrase: Option<&str>) -> Result<()> {
        for timestamp in self.backups.list_snapshots()? {
            let Some(payload) = self.backups.read_snapshot(timestamp)? else {
                continue;
            };
            match decode_vault(&payload, old_passphrase) {
                Ok(decoded) => {
                    let resealed = self.encode(&decoded.records)?;
                    self.storage
                        .set(&snapshot_key(&self.vault_key, timestamp), &resealed)?;
                }
                Err(e) => warn!(timestamp, error = %e, "leaving unreadable snapshot as is"),
            }
        }
        Ok(())
    }

    /// Replace non-encryption settings. Encryption is switched with
    /// [`enable_encryption`](Self::enable_encryption) and
    /// [`disable_encryption`](Self::disable_encryption).
    pub fn update_settings(&mut self, next: VaultSettings) -> Result<()> {
        self.gate()?;
        if next.encryption_enabled != self.settings.encryption_enabled
            || next.passphrase != self.settings.passphrase
        {
            return Err(VaultError::InvalidSettings(
                "encryption settings change through enable/disable encryption".into(),
            ));
        }
        next.validate()?;
        save_settings(self.storage.as_ref(), &self.vault_key, &next)?;
        self.settings = next;
        self.backups.set_retention(self.settings.backup_retention);
        self.backups.rotate()?;
        self.session.lock().apply_settings(&self.settings);
        self.rearm_timer();
        debug!(settings = ?self.settings, "settings updated");
        Ok(())
    }
}
