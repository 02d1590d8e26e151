//! keyvault-core: local API-credential vault with an orphaned-secret
//! recovery engine
//!
//! # Design principles
//! - Storage is treated as untrusted and schema-less; recovery never writes.
//! - Existing secrets are never lost: snapshots precede destructive changes,
//!   and loading falls back through mirror and snapshots.
//! - Secret values never reach the logs; a short SHA-256 fingerprint does.
//!
//! # Module layout
//! - `crypto`     : Argon2id + XChaCha20-Poly1305 vault envelope
//! - `guesser`    : opt-in common-passphrase guessing for legacy ciphertext
//! - `raw_value`  : closed variant type for decoded storage values
//! - `extractor`  : structured walk and regex catch-all for credentials
//! - `service`    : service name canonicalization
//! - `dedup`      : duplicate detection and merge by secret value
//! - `codec`      : serialized vault format
//! - `backup`     : mirror, snapshots, rotation and load fallback
//! - `session`    : lock state, auto-lock timer, delete authorization
//! - `recovery`   : three-pass storage scan
//! - `engine`     : `VaultEngine`, the API callers use
//! - `storage`    : storage trait, memory and file backends, settings I/O
//! - `settings`   : persisted configuration and validation
//! - `clock`      : system and manual time sources
//! - `paths`      : default data locations
//! - `error`      : unified error type

pub mod backup;
pub mod clock;
pub mod codec;
pub mod crypto;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod guesser;
pub mod model;
pub mod paths;
pub mod raw_value;
pub mod recovery;
pub mod service;
pub mod session;
pub mod settings;
pub mod storage;

pub use engine::VaultEngine;
pub use error::{Result, VaultError};
