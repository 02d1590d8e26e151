use serde::Serialize;
use thiserror::Error;

/// Why a delete authorization was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteDenial {
    UnknownToken,
    RecordMismatch,
    AlreadyConsumed,
    Expired,
}

impl std::fmt::Display for DeleteDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DeleteDenial::UnknownToken => "token was never minted by this session",
            DeleteDenial::RecordMismatch => "token was minted for a different record",
            DeleteDenial::AlreadyConsumed => "token has already been used",
            DeleteDenial::Expired => "token is older than five minutes",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage document is corrupt: {0}")]
    Corrupt(String),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Decryption failed (wrong passphrase or tampered payload)")]
    DecryptAuthFailure,

    #[error("Passphrase does not match the configured passphrase")]
    WrongPassphrase,

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Delete not authorized: {0}")]
    DeleteUnauthorized(DeleteDenial),

    #[error("Vault is locked; unlock with the passphrase first")]
    SessionLocked,

    #[error("Cannot lock: encryption is disabled or no passphrase is configured")]
    CannotLock,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        VaultError::StorageUnavailable(err.to_string())
    }
}

impl VaultError {
    /// Stable reason code for callers that branch or render without parsing messages.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::DecryptAuthFailure => "DECRYPT_AUTH_FAILURE",
            VaultError::WrongPassphrase => "WRONG_PASSPHRASE",
            VaultError::MalformedRecord(_) => "MALFORMED_RECORD",
            VaultError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            VaultError::DeleteUnauthorized(_) => "DELETE_UNAUTHORIZED",
            VaultError::SessionLocked => "SESSION_LOCKED",
            VaultError::CannotLock => "CANNOT_LOCK",
            VaultError::NotFound(_) => "NOT_FOUND",
            VaultError::InvalidSettings(_) => "INVALID_SETTINGS",
            VaultError::InvalidRecord(_) => "INVALID_RECORD",
            VaultError::Crypto(_) => "CRYPTO_ERROR",
            VaultError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the user can fix this by re-entering a passphrase.
    pub fn is_passphrase_failure(&self) -> bool {
        matches!(
            self,
            VaultError::DecryptAuthFailure | VaultError::WrongPassphrase | VaultError::SessionLocked
        )
    }
}

/// Serializable error for UI/CLI responses.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl From<&VaultError> for ErrorResponse {
    fn from(error: &VaultError) -> Self {
        let details = match error {
            VaultError::DeleteUnauthorized(denial) => serde_json::to_value(denial)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string)),
            _ => None,
        };
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
            details,
        }
    }
}

impl From<VaultError> for ErrorResponse {
    fn from(error: VaultError) -> Self {
        ErrorResponse::from(&error)
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
