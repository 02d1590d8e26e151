//! Lock state, inactivity auto-lock and delete authorization tokens.
//!
//! The session is a plain state machine driven by timestamps, so every
//! transition can be exercised with a [`ManualClock`](crate::clock::ManualClock).
//! [`AutoLockTimer`] is the only piece that runs on its own: a tokio task that
//! sleeps until the current deadline and then polls the session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::{DeleteDenial, Result, VaultError};
use crate::settings::VaultSettings;

pub const DELETE_TOKEN_TTL_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Locked,
    Unlocked,
}

/// Proof that a delete of `record_id` was requested. Single use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAuthorization {
    pub token_id: Uuid,
    pub record_id: String,
    pub minted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MintedToken {
    record_id: String,
    minted_at: DateTime<Utc>,
    consumed: bool,
}

pub struct VaultSession {
    state: SessionState,
    last_activity: DateTime<Utc>,
    auto_lock_enabled: bool,
    auto_lock_minutes: u32,
    encryption_enabled: bool,
    passphrase: Option<Zeroizing<String>>,
    tokens: HashMap<Uuid, MintedToken>,
}

impl VaultSession {
    /// Starts locked when there is an encrypted vault to protect.
    pub fn new(settings: &VaultSettings, now: DateTime<Utc>) -> Self {
        let mut session = Self {
            state: SessionState::Unlocked,
            last_activity: now,
            auto_lock_enabled: settings.auto_lock_enabled,
            auto_lock_minutes: settings.auto_lock_minutes,
            encryption_enabled: settings.encryption_enabled,
            passphrase: settings
                .passphrase
                .clone()
                .filter(|p| !p.is_empty())
                .map(Zeroizing::new),
            tokens: HashMap::new(),
        };
        if session.can_lock() {
            session.state = SessionState::Locked;
        }
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == SessionState::Locked
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn can_lock(&self) -> bool {
        self.encryption_enabled && self.passphrase.is_some()
    }

    /// Passphrase for sealing and opening the vault, only while unlocked.
    pub fn passphrase(&self) -> Option<&str> {
        match self.state {
            SessionState::Unlocked => self.passphrase.as_deref().map(String::as_str),
            SessionState::Locked => None,
        }
    }

    pub fn lock(&mut self) -> Result<()> {
        if !self.can_lock() {
            return Err(VaultError::CannotLock);
        }
        if self.state != SessionState::Locked {
            info!("vault locked");
        }
        self.state = SessionState::Locked;
        Ok(())
    }

    /// Exact comparison against the configured passphrase.
    pub fn unlock(&mut self, passphrase: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(expected) = &self.passphrase else {
            self.state = SessionState::Unlocked;
            self.last_activity = now;
            return Ok(());
        };
        if expected.as_str() != passphrase {
            debug!("unlock refused");
            return Err(VaultError::WrongPassphrase);
        }
        self.state = SessionState::Unlocked;
        self.last_activity = now;
        info!("vault unlocked");
        Ok(())
    }

    pub fn record_activity(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// When auto-lock will fire, if it can fire at all.
    pub fn lock_deadline(&self) -> Option<DateTime<Utc>> {
        if self.state == SessionState::Locked || !self.can_lock() || !self.auto_lock_enabled {
            return None;
        }
        Some(self.last_activity + Duration::minutes(i64::from(self.auto_lock_minutes)))
    }

    /// Lock if the inactivity deadline has passed. Returns true when this call locked.
    pub fn poll_auto_lock(&mut self, now: DateTime<Utc>) -> bool {
        match self.lock_deadline() {
            Some(deadline) if now > deadline => {
                self.state = SessionState::Locked;
                info!(
                    idle_secs = (now - self.last_activity).num_seconds(),
                    "vault auto-locked after inactivity"
                );
                true
            }
            _ => false,
        }
    }

    /// Pick up changed encryption or auto-lock settings.
    pub fn apply_settings(&mut self, settings: &VaultSettings) {
        self.auto_lock_enabled = settings.auto_lock_enabled;
        self.auto_lock_minutes = settings.auto_lock_minutes;
        self.encryption_enabled = settings.encryption_enabled;
        self.passphrase = settings
            .passphrase
            .clone()
            .filter(|p| !p.is_empty())
            .map(Zeroizing::new);
        if !self.can_lock() {
            self.state = SessionState::Unlocked;
        }
    }

    pub fn mint_delete_authorization(
        &mut self,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> DeleteAuthorization {
        let ttl = Duration::minutes(DELETE_TOKEN_TTL_MINUTES);
        self.tokens.retain(|_, t| now - t.minted_at <= ttl);

        let token_id = Uuid::new_v4();
        self.tokens.insert(
            token_id,
            MintedToken {
                record_id: record_id.to_string(),
                minted_at: now,
                consumed: false,
            },
        );
        debug!(%token_id, record_id, "delete authorization minted");
        DeleteAuthorization {
            token_id,
            record_id: record_id.to_string(),
            minted_at: now,
        }
    }

    /// Check and consume `token` for deleting `record_id`.
    pub fn authorize_delete(
        &mut self,
        record_id: &str,
        token: &DeleteAuthorization,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_delete(record_id, token, now)?;
        self.consume_delete(token);
        Ok(())
    }

    /// Validate `token` for deleting `record_id` without spending it.
    pub fn check_delete(
        &self,
        record_id: &str,
        token: &DeleteAuthorization,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let minted = self
            .tokens
            .get(&token.token_id)
            .ok_or(VaultError::DeleteUnauthorized(DeleteDenial::UnknownToken))?;
        if minted.record_id != record_id || token.record_id != record_id {
            return Err(VaultError::DeleteUnauthorized(DeleteDenial::RecordMismatch));
        }
        if minted.consumed {
            return Err(VaultError::DeleteUnauthorized(DeleteDenial::AlreadyConsumed));
        }
        if now - minted.minted_at > Duration::minutes(DELETE_TOKEN_TTL_MINUTES) {
            return Err(VaultError::DeleteUnauthorized(DeleteDenial::Expired));
        }
        Ok(())
    }

    pub fn consume_delete(&mut self, token: &DeleteAuthorization) {
        if let Some(minted) = self.tokens.get_mut(&token.token_id) {
            minted.consumed = true;
        }
    }
}

/// Background task that locks the session once its inactivity deadline passes.
///
/// There is one task per timer. Call [`AutoLockTimer::rearm`] after activity
/// or an unlock so the task recomputes its deadline. Dropping the timer stops
/// the task.
pub struct AutoLockTimer {
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl AutoLockTimer {
    /// Must be called inside a tokio runtime.
    pub fn spawn(session: Arc<Mutex<VaultSession>>, clock: Arc<dyn Clock>) -> Self {
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let wake_task = wake.clone();

        let handle = tokio::spawn(async move {
            debug!("auto-lock timer started");
            loop {
                let deadline = session.lock().lock_deadline();
                let sleep_for = deadline.map(|d| (d - clock.now()).to_std().unwrap_or_default());

                tokio::select! {
                    _ = sleep_or_park(sleep_for) => {
                        session.lock().poll_auto_lock(clock.now());
                    }
                    _ = wake_task.notified() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("auto-lock timer shutting down");
                            return;
                        }
                    }
                }
            }
        });

        Self {
            wake,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn rearm(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for AutoLockTimer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn sleep_or_park(duration: Option<std::time::Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn encrypted(minutes: u32) -> VaultSettings {
        VaultSettings {
            encryption_enabled: true,
            passphrase: Some("correct horse".into()),
            auto_lock_minutes: minutes,
            ..Default::default()
        }
    }

    #[test]
    fn initial_state_follows_encryption() {
        assert_eq!(VaultSession::new(&VaultSettings::default(), start()).state(), SessionState::Unlocked);
        assert_eq!(VaultSession::new(&encrypted(1), start()).state(), SessionState::Locked);
    }

    #[test]
    fn unlock_requires_exact_passphrase() {
        let mut session = VaultSession::new(&encrypted(1), start());
        assert!(matches!(session.unlock("correct horse ", start()), Err(VaultError::WrongPassphrase)));
        assert!(session.passphrase().is_none());
        session.unlock("correct horse", start()).unwrap();
        assert_eq!(session.passphrase(), Some("correct horse"));
    }

    #[test]
    fn lock_needs_encryption_and_passphrase() {
        let mut plain = VaultSession::new(&VaultSettings::default(), start());
        assert!(matches!(plain.lock(), Err(VaultError::CannotLock)));
        let mut session = VaultSession::new(&encrypted(1), start());
        session.unlock("correct horse", start()).unwrap();
        session.lock().unwrap();
        assert!(session.is_locked());
    }

    #[test]
    fn auto_locks_after_sixty_one_idle_seconds() {
        let clock = ManualClock::new(start());
        let mut session = VaultSession::new(&encrypted(1), clock.now());
        session.unlock("correct horse", clock.now()).unwrap();

        clock.advance(Duration::seconds(30));
        assert!(!session.poll_auto_lock(clock.now()));
        session.record_activity(clock.now());

        clock.advance(Duration::seconds(45));
        assert!(!session.poll_auto_lock(clock.now()));

        clock.advance(Duration::seconds(16));
        assert!(session.poll_auto_lock(clock.now()));
        assert_eq!(session.state(), SessionState::Locked);
    }

    #[test]
    fn auto_lock_never_fires_without_encryption() {
        let mut session = VaultSession::new(&VaultSettings::default(), start());
        assert!(!session.poll_auto_lock(start() + Duration::days(2)));
        assert_eq!(session.state(), SessionState::Unlocked);
    }

    #[test]
    fn delete_token_is_single_use() {
        let mut session = VaultSession::new(&VaultSettings::default(), start());
        let token = session.mint_delete_authorization("r1", start());
        session.authorize_delete("r1", &token, start()).unwrap();
        assert!(matches!(
            session.authorize_delete("r1", &token, start()),
            Err(VaultError::DeleteUnauthorized(DeleteDenial::AlreadyConsumed))
        ));
    }

    #[test]
    fn delete_token_expires_and_binds_record() {
        let mut session = VaultSession::new(&VaultSettings::default(), start());
        let token = session.mint_delete_authorization("r1", start());
        assert!(matches!(
            session.authorize_delete("r2", &token, start()),
            Err(VaultError::DeleteUnauthorized(DeleteDenial::RecordMismatch))
        ));
        assert!(matches!(
            session.authorize_delete("r1", &token, start() + Duration::minutes(6)),
            Err(VaultError::DeleteUnauthorized(DeleteDenial::Expired))
        ));

        let forged = DeleteAuthorization {
            token_id: Uuid::new_v4(),
            record_id: "r1".into(),
            minted_at: start(),
        };
        assert!(matches!(
            session.authorize_delete("r1", &forged, start()),
            Err(VaultError::DeleteUnauthorized(DeleteDenial::UnknownToken))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_locks_idle_session() {
        let clock = Arc::new(ManualClock::new(start()));
        let session = Arc::new(Mutex::new(VaultSession::new(&encrypted(1), clock.now())));
        session.lock().unlock("correct horse", clock.now()).unwrap();

        let timer = AutoLockTimer::spawn(session.clone(), clock.clone());
        tokio::task::yield_now().await;

        clock.advance(Duration::seconds(61));
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        for _ in 0..10 {
            if session.lock().is_locked() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(session.lock().is_locked());
        timer.shutdown().await;
    }
}
