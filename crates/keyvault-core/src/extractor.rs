//! Schema-less credential extraction.
//!
//! Two procedures share the same output type. [`HeuristicExtractor::extract`]
//! walks a decoded value and uses field names and sibling fields to decide
//! what is a credential. [`HeuristicExtractor::scan_patterns`] ignores
//! structure completely and runs regex rules over the raw text of an entry.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::crypto::is_envelope;
use crate::model::{unix_epoch, Liveness, SecretRecord, SecretStatus};
use crate::raw_value::RawValue;
use crate::service::{canonical_service, service_from_key, UNKNOWN_SERVICE};

/// Candidates must be strictly longer than this many characters.
pub const MIN_SECRET_CHARS: usize = 10;
/// Candidates may be at most this many characters.
pub const MAX_SECRET_CHARS: usize = 500;

const FIELD_KEYWORDS: [&str; 5] = ["key", "token", "secret", "api", "access"];

/// Field names that describe a record rather than hold a credential.
const METADATA_FIELDS: [&str; 13] = [
    "id",
    "uuid",
    "name",
    "label",
    "title",
    "service",
    "provider",
    "platform",
    "description",
    "status",
    "createdat",
    "source",
    "isworking",
];

const SERVICE_FIELDS: [&str; 3] = ["service", "provider", "platform"];
const NAME_FIELDS: [&str; 3] = ["name", "label", "title"];

/// Fields that hold the secret of an object already shaped like a record.
const VALUE_FIELDS: [&str; 5] = ["secretvalue", "value", "key", "secret", "apikey"];

/// Nesting guard for pathological input; serde_json stops at 128 anyway.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct PatternRule {
    id: &'static str,
    label: &'static str,
    service_hint: Option<&'static str>,
    pattern: Regex,
}

impl PatternRule {
    fn new(
        id: &'static str,
        label: &'static str,
        service_hint: Option<&'static str>,
        pattern: &str,
    ) -> Self {
        let regex = Regex::new(pattern).expect("valid regex pattern");
        Self {
            id,
            label,
            service_hint,
            pattern: regex,
        }
    }
}

/// Output of a structured walk.
#[derive(Debug, Default, Clone)]
pub struct Extraction {
    pub candidates: Vec<SecretRecord>,
    /// Values of metadata fields seen during the walk. The catch-all pass
    /// must not turn these into candidates.
    pub structural_values: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    shapes: Vec<Regex>,
    rules: Vec<PatternRule>,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        let shapes = [
            // uuid v4
            r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
            // three dot-delimited segments (JWT and friends)
            r"^[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}$",
            // provider prefixes
            r"^(?:sk-|sk_live_|sk_test_|rk_live_|pk_live_|gh[opsu]_|xox[baprs]-|AKIA|ASIA|hf_|gsk_|AIza)[A-Za-z0-9._-]{8,}$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex pattern"))
        .collect();

        // Order matters: a match blocks any later match overlapping it.
        let rules = vec![
            PatternRule::new(
                "anthropic_key",
                "Anthropic key",
                Some("anthropic"),
                r"sk-ant-[A-Za-z0-9_-]{20,}",
            ),
            PatternRule::new(
                "stripe_key",
                "Stripe key",
                Some("stripe"),
                r"\b(?:sk|rk|pk)_(?:live|test)_[A-Za-z0-9]{16,}",
            ),
            PatternRule::new(
                "sk_key",
                "Secret key",
                Some("openai"),
                r"\bsk-[A-Za-z0-9_-]{20,}",
            ),
            PatternRule::new(
                "github_token",
                "GitHub token",
                Some("github"),
                r"\bgh[opsu]_[A-Za-z0-9]{30,}",
            ),
            PatternRule::new(
                "slack_token",
                "Slack token",
                Some("slack"),
                r"\bxox[baprs]-[A-Za-z0-9-]{10,}",
            ),
            PatternRule::new(
                "aws_access_key",
                "AWS access key",
                Some("aws"),
                r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b",
            ),
            PatternRule::new(
                "huggingface_token",
                "Hugging Face token",
                Some("huggingface"),
                r"\bhf_[A-Za-z0-9]{30,}",
            ),
            PatternRule::new(
                "groq_key",
                "Groq key",
                Some("groq"),
                r"\bgsk_[A-Za-z0-9]{40,}",
            ),
            PatternRule::new(
                "google_api_key",
                "Google API key",
                Some("google"),
                r"\bAIza[0-9A-Za-z_-]{35}",
            ),
            PatternRule::new(
                "jwt",
                "JWT",
                None,
                r"\beyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}",
            ),
            PatternRule::new(
                "uuid",
                "UUID credential",
                None,
                r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}\b",
            ),
            PatternRule::new(
                "long_alnum",
                "Recovered secret",
                None,
                r"[A-Za-z0-9]{32,}",
            ),
        ];

        Self { shapes, rules }
    }

    /// Walk `value` found under `source_key` and emit credential candidates.
    pub fn extract(&self, source_key: &str, value: &RawValue) -> Extraction {
        let mut walk = Walk {
            extractor: self,
            source_key,
            seen: HashSet::new(),
            out: Extraction::default(),
        };
        walk.visit(value, source_key, None, 0);
        walk.out
    }

    /// Regex-only pass over the raw text of an entry.
    ///
    /// Values in `exclude` are never emitted, and neither is anything that
    /// overlaps them. Cipher envelopes are opaque and produce nothing.
    pub fn scan_patterns(
        &self,
        source_key: &str,
        raw: &str,
        exclude: &HashSet<String>,
    ) -> Vec<SecretRecord> {
        if is_envelope(raw) {
            return Vec::new();
        }

        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for rule in &self.rules {
            for found in rule.pattern.find_iter(raw) {
                let span = (found.start(), found.end());
                if claimed.iter().any(|c| span.0 < c.1 && c.0 < span.1) {
                    continue;
                }
                claimed.push(span);

                let value = found.as_str();
                if !within_length_cap(value) || exclude.contains(value) {
                    continue;
                }
                if !seen.insert(value.to_string()) {
                    continue;
                }
                trace!(rule = rule.id, source_key, "pattern match");

                let service = service_from_key(source_key)
                    .or(rule.service_hint)
                    .unwrap_or(UNKNOWN_SERVICE);
                out.push(candidate(
                    source_key,
                    value,
                    rule.label.to_string(),
                    service.to_string(),
                    &Siblings::default(),
                ));
            }
        }
        out
    }

    fn looks_like_credential(&self, value: &str) -> bool {
        self.shapes.iter().any(|shape| shape.is_match(value))
    }
}

struct Walk<'a> {
    extractor: &'a HeuristicExtractor,
    source_key: &'a str,
    seen: HashSet<String>,
    out: Extraction,
}

impl Walk<'_> {
    fn visit(
        &mut self,
        value: &RawValue,
        field: &str,
        parent: Option<&BTreeMap<String, RawValue>>,
        depth: usize,
    ) {
        if depth > MAX_DEPTH {
            return;
        }
        match value {
            RawValue::Array(items) => {
                for item in items {
                    self.visit(item, field, parent, depth + 1);
                }
            }
            RawValue::Map(map) => {
                for (key, child) in map {
                    if is_metadata_field(key) {
                        if let Some(text) = child.as_str() {
                            self.out.structural_values.insert(text.to_string());
                        }
                        continue;
                    }
                    self.visit(child, key, Some(map), depth + 1);
                }
            }
            RawValue::String(text) => {
                if let Some(nested) = RawValue::parse_container(text) {
                    self.visit(&nested, field, None, depth + 1);
                } else {
                    self.leaf(text, field, parent);
                }
            }
            RawValue::Null | RawValue::Bool(_) | RawValue::Number(_) => {}
        }
    }

    fn leaf(&mut self, text: &str, field: &str, parent: Option<&BTreeMap<String, RawValue>>) {
        if !within_length_cap(text) {
            return;
        }
        if !(field_suggests_secret(field) || self.extractor.looks_like_credential(text)) {
            return;
        }
        if !self.seen.insert(text.to_string()) {
            return;
        }

        let siblings = parent.map(Siblings::from_map).unwrap_or_default();
        let service = match &siblings.service {
            Some(service) => canonical_service(service),
            None => service_from_key(self.source_key)
                .unwrap_or(UNKNOWN_SERVICE)
                .to_string(),
        };
        let name = match &siblings.name {
            Some(name) if is_value_field(field) => name.clone(),
            Some(name) => format!("{name} ({})", humanize(field)),
            None => humanize(field),
        };
        self.out
            .candidates
            .push(candidate(self.source_key, text, name, service, &siblings));
    }
}

/// Metadata carried over from the object a candidate was found in.
#[derive(Debug, Default)]
struct Siblings {
    service: Option<String>,
    name: Option<String>,
    description: Option<String>,
    status: Option<SecretStatus>,
    created_at: Option<DateTime<Utc>>,
}

impl Siblings {
    fn from_map(map: &BTreeMap<String, RawValue>) -> Self {
        let mut siblings = Siblings::default();
        for (key, value) in map {
            let lowered = key.to_ascii_lowercase();
            let text = value.as_str().map(str::trim).filter(|t| !t.is_empty());
            if SERVICE_FIELDS.contains(&lowered.as_str()) {
                siblings.service = siblings.service.or(text.map(String::from));
            } else if NAME_FIELDS.contains(&lowered.as_str()) {
                siblings.name = siblings.name.or(text.map(String::from));
            } else if lowered == "description" {
                siblings.description = text.map(String::from);
            } else if lowered == "status" {
                siblings.status = text.and_then(SecretStatus::parse);
            } else if lowered == "createdat" {
                siblings.created_at = parse_timestamp(value);
            }
        }
        siblings
    }
}

fn candidate(
    source_key: &str,
    value: &str,
    name: String,
    service: String,
    siblings: &Siblings,
) -> SecretRecord {
    SecretRecord {
        id: candidate_id(source_key, value),
        name,
        service: canonical_service(&service),
        secret_value: value.to_string(),
        description: siblings.description.clone(),
        status: siblings.status.unwrap_or_default(),
        created_at: siblings.created_at.unwrap_or_else(unix_epoch),
        source: Some(source_key.to_string()),
        is_working: Liveness::Unknown,
    }
}

/// Stable id so repeated scans of the same storage agree.
pub fn candidate_id(source_key: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    format!("rec-{}", &hex::encode(digest)[..16])
}

fn parse_timestamp(value: &RawValue) -> Option<DateTime<Utc>> {
    match value {
        RawValue::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        RawValue::Number(millis) if millis.is_finite() => {
            Utc.timestamp_millis_opt(*millis as i64).single()
        }
        _ => None,
    }
}

fn within_length_cap(value: &str) -> bool {
    let chars = value.chars().count();
    chars > MIN_SECRET_CHARS && chars <= MAX_SECRET_CHARS
}

fn field_suggests_secret(field: &str) -> bool {
    let lowered = field.to_ascii_lowercase();
    FIELD_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

fn is_metadata_field(field: &str) -> bool {
    METADATA_FIELDS.contains(&field.to_ascii_lowercase().as_str())
}

fn is_value_field(field: &str) -> bool {
    VALUE_FIELDS.contains(&field.to_ascii_lowercase().as_str())
}

/// `apiKey`, `api_key` and `API-KEY` all become `Api Key`.
pub fn humanize(field: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = field.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '_' | '-' | ' ' | '.' | '/' | ':') {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        let prev = i.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(i + 1).copied();
        let boundary = c.is_uppercase()
            && !current.is_empty()
            && (prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit())
                || next.is_some_and(char::is_lowercase));
        if boundary {
            words.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    if words.is_empty() {
        return "Recovered Secret".to_string();
    }
    words
        .iter()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
