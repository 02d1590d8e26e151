//! Duplicate detection by exact secret value.

use std::collections::HashSet;

use tracing::debug;
use uuid::Uuid;

use crate::model::{fingerprint, MergeReport, SecretRecord};

/// Drop records whose `secret_value` was already seen. First occurrence wins.
pub fn dedupe(records: Vec<SecretRecord>) -> Vec<SecretRecord> {
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.secret_value.clone()))
        .collect()
}

/// Append `incoming` to `existing`, skipping values the vault already holds.
///
/// Incoming ids that collide with an id already present are replaced with a
/// fresh uuid so ids stay unique.
pub fn merge(
    existing: Vec<SecretRecord>,
    incoming: Vec<SecretRecord>,
) -> (Vec<SecretRecord>, MergeReport) {
    let mut values: HashSet<String> = existing.iter().map(|r| r.secret_value.clone()).collect();
    let mut ids: HashSet<String> = existing.iter().map(|r| r.id.clone()).collect();
    let mut merged = existing;
    let mut report = MergeReport::default();

    for mut record in incoming {
        if !values.insert(record.secret_value.clone()) {
            debug!(fingerprint = %fingerprint(&record.secret_value), "skipping duplicate secret");
            report.duplicates += 1;
            continue;
        }
        if !ids.insert(record.id.clone()) {
            let fresh = Uuid::new_v4().to_string();
            debug!(old = %record.id, new = %fresh, "re-keying colliding record id");
            record.id = fresh;
            ids.insert(record.id.clone());
        }
        merged.push(record);
        report.added += 1;
    }

    (merged, report)
}
