//! Duplicate detection strategies.
//!
//! Epistemic foundation:
//! - K_i: Each strategy maps a record to an optional dedup key
//! - K_i: The first record per dedup key is kept, later ones are duplicates
//! - B_i: A record may yield no dedup key → it is always kept

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::models::{is_empty_value, value_text, DedupConfig, KeyFields, Record, StrategyKind};

/// How records are matched as duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupStrategy {
    /// Normalized business key
    Identity(KeyFields),
    /// SHA-256 of the canonical (key-sorted) JSON of the whole record
    ExactHash,
    /// Case-folded, sorted values of several fields joined with `|`
    Fuzzy(Vec<String>),
}

impl DedupStrategy {
    pub fn from_config(config: &DedupConfig, key_fields: &KeyFields) -> Self {
        match config.strategy {
            StrategyKind::Identity => Self::Identity(key_fields.clone()),
            StrategyKind::Exact => Self::ExactHash,
            StrategyKind::Fuzzy => Self::Fuzzy(config.fuzzy_fields.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity(_) => "identity",
            Self::ExactHash => "exact",
            Self::Fuzzy(_) => "fuzzy",
        }
    }

    /// Dedup key of a record, `None` if the record cannot be matched.
    pub fn dedup_key(&self, record: &Record) -> Option<String> {
        match self {
            Self::Identity(key_fields) => key_fields.extract(record),
            Self::ExactHash => Some(record_hash(record)),
            Self::Fuzzy(fields) => fuzzy_key(record, fields),
        }
    }
}

/// Rebuild a value with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// SHA-256 hex digest of a record's canonical JSON.
pub fn record_hash(record: &Record) -> String {
    let canonical = canonical(&Value::Object(record.clone()));
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{:x}", digest)
}

fn fuzzy_key(record: &Record, fields: &[String]) -> Option<String> {
    let mut values: Vec<String> = fields
        .iter()
        .filter_map(|f| record.get(f))
        .filter(|v| !is_empty_value(v))
        .map(|v| value_text(v).trim().to_lowercase())
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort();
    Some(values.join("|"))
}

/// Deduplication counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub original: usize,
    pub unique: usize,
    pub duplicates: usize,
    /// Duplicates as a percentage of the input
    pub dedup_rate: f64,
    /// Size reduction as a percentage of the input
    pub reduction_percentage: f64,
}

impl DedupStats {
    pub fn new(original: usize, unique: usize, duplicates: usize) -> Self {
        let percent = |n: usize| {
            if original == 0 {
                0.0
            } else {
                n as f64 / original as f64 * 100.0
            }
        };
        Self {
            original,
            unique,
            duplicates,
            dedup_rate: percent(duplicates),
            reduction_percentage: percent(original.saturating_sub(unique)),
        }
    }
}

/// Result of a dedup pass.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// Kept records in input order
    pub unique: Vec<Record>,
    /// Removed records in input order
    pub duplicates: Vec<Record>,
    pub stats: DedupStats,
}

/// Records sharing one dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub key: String,
    pub records: Vec<Record>,
}

/// Removes duplicates under one strategy.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    strategy: DedupStrategy,
}

impl Deduplicator {
    pub fn new(strategy: DedupStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &DedupStrategy {
        &self.strategy
    }

    /// Keep the first record per dedup key. Records without a key are kept.
    pub fn deduplicate(&self, records: Vec<Record>) -> DedupOutcome {
        let original = records.len();
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        let mut duplicates = Vec::new();

        for record in records {
            let duplicate = match self.strategy.dedup_key(&record) {
                Some(key) => !seen.insert(key),
                None => false,
            };
            if duplicate {
                duplicates.push(record);
            } else {
                unique.push(record);
            }
        }

        let stats = DedupStats::new(original, unique.len(), duplicates.len());
        info!(
            strategy = self.strategy.name(),
            original = original,
            unique = stats.unique,
            duplicates = stats.duplicates,
            "Deduplicated"
        );
        DedupOutcome {
            unique,
            duplicates,
            stats,
        }
    }

    /// Groups of more than one record sharing a dedup key, in first-seen order.
    pub fn groups(&self, records: &[Record]) -> Vec<DuplicateGroup> {
        group_by(records, |r| self.strategy.dedup_key(r))
    }
}

/// Groups of more than one record sharing a business key.
pub fn duplicate_groups(records: &[Record], key_fields: &KeyFields) -> Vec<DuplicateGroup> {
    group_by(records, |r| key_fields.extract(r))
}

fn group_by<F>(records: &[Record], key_of: F) -> Vec<DuplicateGroup>
where
    F: Fn(&Record) -> Option<String>,
{
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<DuplicateGroup> = Vec::new();

    for record in records {
        let Some(key) = key_of(record) else { continue };
        match positions.get(&key) {
            Some(&i) => groups[i].records.push(record.clone()),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push(DuplicateGroup {
                    key,
                    records: vec![record.clone()],
                });
            }
        }
    }

    groups.retain(|g| g.records.len() > 1);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record_from;
    use serde_json::json;

    fn identity() -> Deduplicator {
        Deduplicator::new(DedupStrategy::Identity(KeyFields::new([
            "taxpayer_id",
            "taxpayer_number",
        ])))
    }

    #[test]
    fn test_identity_keeps_first_and_unkeyed() {
        let records = vec![
            record_from([("taxpayer_id", json!("1")), ("v", json!("first"))]),
            record_from([("taxpayer_number", json!(" 1")), ("v", json!("second"))]),
            record_from([("name", json!("no id"))]),
            record_from([("name", json!("no id"))]),
            record_from([("taxpayer_id", json!("2"))]),
        ];
        let outcome = identity().deduplicate(records);

        assert_eq!(outcome.unique.len(), 4);
        assert_eq!(outcome.duplicates.len(), 1);
        assert_eq!(outcome.unique[0]["v"], "first");
        assert_eq!(outcome.duplicates[0]["v"], "second");
        assert_eq!(outcome.stats.dedup_rate, 20.0);
    }

    #[test]
    fn test_identity_dedup_is_idempotent() {
        let mut state = 0x1234_5678_9ABC_DEF0u64;
        for _ in 0..20 {
            let records: Vec<Record> = (0..60)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    match state % 5 {
                        0 => record_from([("name", json!("unkeyed"))]),
                        n => record_from([("taxpayer_id", json!(state % 17)), ("n", json!(n))]),
                    }
                })
                .collect();

            let once = identity().deduplicate(records);
            let twice = identity().deduplicate(once.unique.clone());
            assert!(twice.duplicates.is_empty());
            assert_eq!(twice.unique, once.unique);
        }
    }

    #[test]
    fn test_exact_hash_ignores_field_order() {
        let mut a = Record::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!({"b": 2, "a": 1}));
        let mut b = Record::new();
        b.insert("y".into(), json!({"a": 1, "b": 2}));
        b.insert("x".into(), json!(1));
        let c = record_from([("x", json!(2))]);

        assert_eq!(record_hash(&a), record_hash(&b));
        assert_eq!(record_hash(&a).len(), 64);

        let outcome = Deduplicator::new(DedupStrategy::ExactHash).deduplicate(vec![a, b, c]);
        assert_eq!(outcome.unique.len(), 2);
        assert_eq!(outcome.duplicates.len(), 1);
    }

    #[test]
    fn test_fuzzy_matches_across_identity_keys() {
        let fields = vec!["name".to_string(), "city".to_string()];
        let records = vec![
            record_from([("id", json!("1")), ("name", json!("Acme ")), ("city", json!("AUSTIN"))]),
            record_from([("id", json!("2")), ("name", json!("acme")), ("city", json!("austin"))]),
            record_from([("id", json!("3"))]),
        ];
        let outcome = Deduplicator::new(DedupStrategy::Fuzzy(fields)).deduplicate(records);
        assert_eq!(outcome.unique.len(), 2);
        assert_eq!(outcome.duplicates[0]["id"], "2");
    }

    #[test]
    fn test_duplicate_groups() {
        let records = vec![
            record_from([("taxpayer_id", json!("1"))]),
            record_from([("taxpayer_id", json!("2"))]),
            record_from([("taxpayer_id", json!("1")), ("x", json!(true))]),
            record_from([("other", json!("k"))]),
        ];
        let groups = duplicate_groups(&records, &KeyFields::single("taxpayer_id"));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "1");
        assert_eq!(groups[0].records.len(), 2);
    }

    #[test]
    fn test_stats_on_empty_input() {
        let stats = DedupStats::new(0, 0, 0);
        assert_eq!(stats.dedup_rate, 0.0);
        assert_eq!(stats.reduction_percentage, 0.0);
    }
}
