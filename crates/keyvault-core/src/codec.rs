//! Serialized vault format: a JSON array of records, optionally sealed in a
//! cipher envelope.

use serde_json::Value;
use tracing::warn;

use crate::crypto::{decrypt, encrypt, DecryptFailure, DecryptOutcome, KdfParams};
use crate::error::{Result, VaultError};
use crate::model::SecretRecord;

/// Records decoded from a payload plus the number of entries that were dropped.
#[derive(Debug, Default)]
pub struct DecodedVault {
    pub records: Vec<SecretRecord>,
    pub skipped_malformed: usize,
}

/// Encryption applied when writing a payload.
#[derive(Clone, Copy)]
pub enum Sealing<'a> {
    Plain,
    Passphrase { passphrase: &'a str, kdf: &'a KdfParams },
}

pub fn encode_vault(records: &[SecretRecord], sealing: Sealing<'_>) -> Result<String> {
    match sealing {
        Sealing::Plain => Ok(serde_json::to_string(records)?),
        Sealing::Passphrase { passphrase, kdf } => encrypt(records, passphrase, kdf),
    }
}

/// Parse a payload. JSON is tried first, then decryption with `passphrase`.
///
/// Individual malformed records are skipped and counted; a payload that is
/// not an array at all is an error.
pub fn decode_vault(payload: &str, passphrase: Option<&str>) -> Result<DecodedVault> {
    if let Ok(value) = serde_json::from_str::<Value>(payload) {
        return records_from_value(value);
    }
    let Some(passphrase) = passphrase else {
        if crate::crypto::is_envelope(payload) {
            return Err(VaultError::DecryptAuthFailure);
        }
        return Err(VaultError::MalformedRecord("vault payload is not JSON".into()));
    };
    match decrypt(payload, passphrase) {
        DecryptOutcome::Json(value) => records_from_value(value),
        DecryptOutcome::Failed(DecryptFailure::Authentication) => Err(VaultError::DecryptAuthFailure),
        DecryptOutcome::Failed(reason) => Err(VaultError::MalformedRecord(format!(
            "vault envelope unreadable: {reason:?}"
        ))),
        DecryptOutcome::NotCiphertext => {
            Err(VaultError::MalformedRecord("vault payload is not JSON".into()))
        }
    }
}

fn records_from_value(value: Value) -> Result<DecodedVault> {
    let Value::Array(items) = value else {
        return Err(VaultError::MalformedRecord(
            "vault payload is not a JSON array".into(),
        ));
    };
    let mut decoded = DecodedVault::default();
    for (index, item) in items.into_iter().enumerate() {
        let parsed = serde_json::from_value::<SecretRecord>(item)
            .map_err(VaultError::from)
            .and_then(SecretRecord::normalized);
        match parsed {
            Ok(record) => decoded.records.push(record),
            Err(e) => {
                warn!(index, error = %e, "skipping malformed vault record");
                decoded.skipped_malformed += 1;
            }
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{unix_epoch, Liveness, SecretStatus};

    fn rec(id: &str) -> SecretRecord {
        SecretRecord {
            id: id.into(),
            name: "n".into(),
            service: "openai".into(),
            secret_value: format!("secret-{id}"),
            description: None,
            status: SecretStatus::Active,
            created_at: unix_epoch(),
            source: None,
            is_working: Liveness::Unknown,
        }
    }

    #[test]
    fn plain_and_sealed_payloads_decode() {
        let records = vec![rec("1"), rec("2")];
        let plain = encode_vault(&records, Sealing::Plain).unwrap();
        assert_eq!(decode_vault(&plain, None).unwrap().records, records);

        let kdf = KdfParams::minimal();
        let sealed = encode_vault(&records, Sealing::Passphrase { passphrase: "pw", kdf: &kdf }).unwrap();
        assert_eq!(decode_vault(&sealed, Some("pw")).unwrap().records, records);
        assert!(matches!(decode_vault(&sealed, Some("nope")), Err(VaultError::DecryptAuthFailure)));
        assert!(matches!(decode_vault(&sealed, None), Err(VaultError::DecryptAuthFailure)));
    }

    #[test]
    fn malformed_records_are_skipped() {
        let payload = r#"[
            {"id":"1","name":"a","service":"openai","secretValue":"abc"},
            {"id":"2","name":"b","service":"openai","secretValue":""},
            {"id":"3","name":"c"},
            42
        ]"#;
        let decoded = decode_vault(payload, None).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.skipped_malformed, 3);
    }

    #[test]
    fn non_array_payload_is_an_error() {
        assert!(matches!(decode_vault("{}", None), Err(VaultError::MalformedRecord(_))));
        assert!(matches!(decode_vault("garbage", Some("pw")), Err(VaultError::MalformedRecord(_))));
    }
}
