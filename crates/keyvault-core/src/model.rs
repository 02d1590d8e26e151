use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, VaultError};
use crate::service::canonical_service;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretStatus {
    #[default]
    Active,
    Expired,
    Revoked,
}

impl SecretStatus {
    /// Lenient parse used when reading legacy data.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "active" => Some(SecretStatus::Active),
            "expired" => Some(SecretStatus::Expired),
            "revoked" => Some(SecretStatus::Revoked),
            _ => None,
        }
    }
}

/// Result of the last live test against the provider. Serialized as `null|true|false`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Liveness {
    #[default]
    Unknown,
    Working,
    Broken,
}

impl From<Option<bool>> for Liveness {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Liveness::Unknown,
            Some(true) => Liveness::Working,
            Some(false) => Liveness::Broken,
        }
    }
}

impl From<Liveness> for Option<bool> {
    fn from(value: Liveness) -> Self {
        match value {
            Liveness::Unknown => None,
            Liveness::Working => Some(true),
            Liveness::Broken => Some(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    pub id: String,
    pub name: String,
    pub service: String,
    #[serde(alias = "key", alias = "value")]
    pub secret_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: SecretStatus,
    #[serde(default = "unix_epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub is_working: Liveness,
}

/// Placeholder timestamp for records whose origin time is unknown.
pub fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

/// Short SHA-256 fingerprint of a secret, safe to put in logs.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..4])
}

impl SecretRecord {
    /// Enforce the record invariants: non-empty secret, canonical service.
    pub fn normalized(mut self) -> Result<Self> {
        if self.secret_value.is_empty() {
            return Err(VaultError::MalformedRecord(format!(
                "record {} has an empty secret value",
                self.id
            )));
        }
        if self.id.trim().is_empty() {
            return Err(VaultError::MalformedRecord(
                "record has an empty id".to_string(),
            ));
        }
        self.service = canonical_service(&self.service);
        Ok(self)
    }
}

/// Input for an explicit add.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSecret {
    pub name: String,
    pub service: String,
    pub secret_value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretPatch {
    pub name: Option<String>,
    pub service: Option<String>,
    pub secret_value: Option<String>,
    pub description: Option<String>,
    pub status: Option<SecretStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub source_key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryResult {
    pub records: Vec<SecretRecord>,
    pub locations: Vec<SourceLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub timestamp: i64,
    pub records: Vec<SecretRecord>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceCount {
    pub service: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub revoked: usize,
    pub per_service: Vec<ServiceCount>,
}

impl VaultStats {
    pub fn from_records(records: &[SecretRecord]) -> Self {
        let mut stats = VaultStats {
            total: records.len(),
            ..Default::default()
        };
        let mut per_service: std::collections::BTreeMap<&str, usize> = Default::default();
        for record in records {
            match record.status {
                SecretStatus::Active => stats.active += 1,
                SecretStatus::Expired => stats.expired += 1,
                SecretStatus::Revoked => stats.revoked += 1,
            }
            *per_service.entry(record.service.as_str()).or_default() += 1;
        }
        let mut per_service: Vec<ServiceCount> = per_service
            .into_iter()
            .map(|(service, count)| ServiceCount {
                service: service.to_string(),
                count,
            })
            .collect();
        per_service.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.service.cmp(&b.service)));
        stats.per_service = per_service;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, service: &str, status: SecretStatus) -> SecretRecord {
        SecretRecord {
            id: id.into(),
            name: id.into(),
            service: service.into(),
            secret_value: format!("value-for-{id}"),
            description: None,
            status,
            created_at: Utc::now(),
            source: None,
            is_working: Liveness::Unknown,
        }
    }

    #[test]
    fn serializes_with_camel_case_and_nullable_liveness() {
        let rec = record("a", "openai", SecretStatus::Active);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["secretValue"], "value-for-a");
        assert_eq!(json["status"], "active");
        assert!(json["isWorking"].is_null());

        let mut broken = rec.clone();
        broken.is_working = Liveness::Broken;
        let json = serde_json::to_value(&broken).unwrap();
        assert_eq!(json["isWorking"], false);
    }

    #[test]
    fn legacy_key_field_is_accepted() {
        let json = r#"{"id":"1","name":"n","service":"BinanceAPI","key":"abc","createdAt":"2024-01-01T00:00:00Z"}"#;
        let rec: SecretRecord = serde_json::from_str(json).unwrap();
        let rec = rec.normalized().unwrap();
        assert_eq!(rec.secret_value, "abc");
        assert_eq!(rec.service, "binance");
        assert_eq!(rec.is_working, Liveness::Unknown);
    }

    #[test]
    fn empty_secret_is_malformed() {
        let mut rec = record("a", "x", SecretStatus::Active);
        rec.secret_value.clear();
        assert!(matches!(rec.normalized(), Err(VaultError::MalformedRecord(_))));
    }

    #[test]
    fn stats_count_status_and_services() {
        let records = vec![
            record("1", "openai", SecretStatus::Active),
            record("2", "openai", SecretStatus::Expired),
            record("3", "binance", SecretStatus::Revoked),
            record("4", "aws", SecretStatus::Active),
        ];
        let stats = VaultStats::from_records(&records);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.per_service[0].service, "openai");
        assert_eq!(stats.per_service[0].count, 2);
        assert_eq!(stats.per_service[1].service, "aws");
    }
}
