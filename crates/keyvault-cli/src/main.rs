use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use keyvault_core::error::ErrorResponse;
use keyvault_core::model::{NewSecret, SecretRecord};
use keyvault_core::paths::{data_dir, STORE_FILE};
use keyvault_core::session::SessionState;
use keyvault_core::settings::{VaultSettings, DEFAULT_VAULT_KEY};
use keyvault_core::storage::FileStorage;
use keyvault_core::{VaultEngine, VaultError};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "keyvault")]
#[command(about = "Local API key vault with orphaned-secret recovery", long_about = None)]
struct Cli {
    /// Directory holding the vault store (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Storage key of the live vault
    #[arg(long, global = true, default_value = DEFAULT_VAULT_KEY)]
    vault_key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored secrets (values masked)
    List,

    /// Add a secret; the value is prompted for unless given
    Add {
        name: String,
        service: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        value: Option<String>,
    },

    /// Per-status and per-service counts
    Stats,

    /// Scan storage for orphaned secrets
    Recover {
        /// Merge the findings into the vault
        #[arg(long)]
        merge: bool,
    },

    /// List snapshot timestamps
    Snapshots,

    /// Replace the vault with a snapshot
    Restore { timestamp: i64 },

    /// Delete a secret
    Delete {
        id: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Encrypt the vault with a new passphrase
    Encrypt,

    /// Store the vault unencrypted
    Decrypt,

    /// Show or change settings
    Config {
        #[arg(long)]
        retention: Option<usize>,
        #[arg(long)]
        auto_lock_minutes: Option<u32>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        allow_password_guessing: Option<bool>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordView<'a> {
    id: &'a str,
    name: &'a str,
    service: &'a str,
    status: keyvault_core::model::SecretStatus,
    masked_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

impl<'a> From<&'a SecretRecord> for RecordView<'a> {
    fn from(record: &'a SecretRecord) -> Self {
        Self {
            id: &record.id,
            name: &record.name,
            service: &record.service,
            status: record.status,
            masked_value: mask(&record.secret_value),
            source: record.source.as_deref(),
        }
    }
}

fn mask(value: &str) -> String {
    let shown: String = value.chars().take(4).collect();
    format!("{shown}****")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("KEYVAULT_PASSPHRASE") {
        return Ok(Zeroizing::new(pw));
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn read_new_passphrase() -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("KEYVAULT_PASSPHRASE") {
        return Ok(Zeroizing::new(pw));
    }
    let first = Zeroizing::new(
        rpassword::prompt_password("New passphrase: ").map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ")
            .map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    if *first != *second {
        return Err(anyhow!("passphrases do not match"));
    }
    Ok(first)
}

fn open_engine(cli: &Cli) -> Result<VaultEngine> {
    let dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => data_dir()?,
    };
    let path = dir.join(STORE_FILE);
    let storage = FileStorage::open(&path)
        .with_context(|| format!("opening vault store at {}", path.display()))?;
    let mut engine = VaultEngine::open(Arc::new(storage), &cli.vault_key)?;
    if engine.session_state() == SessionState::Locked {
        let passphrase = read_passphrase("Vault passphrase: ")?;
        engine.unlock(&passphrase)?;
    }
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut engine = open_engine(&cli)?;
    engine.start_auto_lock_timer();

    let outcome = run(&mut engine, cli.command);
    engine.shutdown().await;
    if let Err(err) = &outcome {
        if let Some(vault_err) = err.downcast_ref::<VaultError>() {
            eprintln!("{}", serde_json::to_string_pretty(&ErrorResponse::from(vault_err))?);
        }
    }
    outcome
}

fn run(engine: &mut VaultEngine, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            let views: Vec<RecordView> = engine.records()?.iter().map(RecordView::from).collect();
            print_json(&views)?;
        }
        Commands::Add {
            name,
            service,
            description,
            value,
        } => {
            let secret_value = match value {
                Some(value) => value,
                None => rpassword::prompt_password("Secret value: ")
                    .map_err(|e| anyhow!("secret prompt: {e}"))?,
            };
            let record = engine.add_secret(NewSecret {
                name,
                service,
                secret_value,
                description,
            })?;
            print_json(&RecordView::from(&record))?;
        }
        Commands::Stats => {
            print_json(&engine.stats()?)?;
        }
        Commands::Recover { merge } => {
            let result = engine.recover_all()?;
            let views: Vec<RecordView> = result.records.iter().map(RecordView::from).collect();
            print_json(&serde_json::json!({
                "records": views,
                "locations": result.locations,
            }))?;
            if merge {
                let report = engine.merge_recovered(result.records)?;
                info!(added = report.added, duplicates = report.duplicates, "merge complete");
                print_json(&report)?;
            }
        }
        Commands::Snapshots => {
            let snapshots: Vec<serde_json::Value> = engine
                .list_snapshots()?
                .into_iter()
                .map(|ts| {
                    let taken = Utc
                        .timestamp_millis_opt(ts)
                        .single()
                        .map(|t| t.to_rfc3339());
                    serde_json::json!({ "timestamp": ts, "takenAt": taken })
                })
                .collect();
            print_json(&snapshots)?;
        }
        Commands::Restore { timestamp } => {
            let count = engine.restore_snapshot(timestamp)?;
            println!("restored {count} records from snapshot {timestamp}");
        }
        Commands::Delete { id, yes } => {
            if !yes {
                return Err(anyhow!("refusing to delete {id} without --yes"));
            }
            let token = engine.mint_delete_authorization(&id)?;
            let removed = engine.delete(&id, &token)?;
            print_json(&RecordView::from(&removed))?;
        }
        Commands::Encrypt => {
            let passphrase = read_new_passphrase()?;
            engine.enable_encryption(&passphrase)?;
            println!("vault encrypted");
        }
        Commands::Decrypt => {
            let passphrase = read_passphrase("Current passphrase: ")?;
            engine.disable_encryption(&passphrase)?;
            println!("vault stored unencrypted");
        }
        Commands::Config {
            retention,
            auto_lock_minutes,
            workers,
            allow_password_guessing,
        } => {
            let current = engine.settings().clone();
            let next = VaultSettings {
                backup_retention: retention.unwrap_or(current.backup_retention),
                auto_lock_minutes: auto_lock_minutes.unwrap_or(current.auto_lock_minutes),
                recovery_workers: workers.unwrap_or(current.recovery_workers),
                allow_password_guessing: allow_password_guessing
                    .unwrap_or(current.allow_password_guessing),
                ..current.clone()
            };
            if next != current {
                engine.update_settings(next)?;
            }
            let shown = engine.settings();
            print_json(&serde_json::json!({
                "encryptionEnabled": shown.encryption_enabled,
                "autoLockEnabled": shown.auto_lock_enabled,
                "autoLockMinutes": shown.auto_lock_minutes,
                "backupRetention": shown.backup_retention,
                "recoveryWorkers": shown.recovery_workers,
                "allowPasswordGuessing": shown.allow_password_guessing,
                "kdf": shown.kdf,
            }))?;
        }
    }
    Ok(())
}
