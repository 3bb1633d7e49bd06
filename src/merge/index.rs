//! Per-source index of records by business key.
//!
//! Epistemic foundation:
//! - K_i: One indexed record per (source, key); last write wins within a source
//! - B_i: A record may carry no usable key → counted in `skipped`, never indexed

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::{KeyFields, Record};

/// A record attached to its business key and source.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    pub key: String,
    pub source: String,
    /// Fields as the source delivered them
    pub raw: Record,
    /// Fields as they enter the merged record (`<source>_<field>` when prefixed)
    pub fields: Record,
}

/// Records of one source indexed by business key.
#[derive(Debug, Clone)]
pub struct SourceIndex {
    source: String,
    records: HashMap<String, IndexedRecord>,
    /// Keys in first-seen order
    order: Vec<String>,
    skipped: usize,
}

impl SourceIndex {
    /// Index `records` of `source` by the first usable candidate key field.
    pub fn build<I>(records: I, source: &str, key_fields: &KeyFields, prefix: bool) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let mut index = Self {
            source: source.to_string(),
            records: HashMap::new(),
            order: Vec::new(),
            skipped: 0,
        };

        for raw in records {
            let Some(key) = key_fields.extract(&raw) else {
                index.skipped += 1;
                continue;
            };

            let fields = if prefix {
                raw.iter()
                    .map(|(k, v)| (format!("{source}_{k}"), v.clone()))
                    .collect()
            } else {
                raw.clone()
            };

            let entry = IndexedRecord {
                key: key.clone(),
                source: source.to_string(),
                raw,
                fields,
            };
            if index.records.insert(key.clone(), entry).is_none() {
                index.order.push(key);
            }
        }

        if index.skipped > 0 {
            warn!(
                source = %source,
                skipped = index.skipped,
                candidates = ?key_fields.fields(),
                "Records without a usable key were skipped"
            );
        }
        debug!(source = %source, indexed = index.order.len(), "Source indexed");
        index
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Records without a usable key.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn get(&self, key: &str) -> Option<&IndexedRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Keys in first-seen order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record_from;
    use serde_json::json;

    fn key_fields() -> KeyFields {
        KeyFields::new(["taxpayer_id", "taxpayer_number", "id"])
    }

    #[test]
    fn test_build_skips_unkeyed_and_last_write_wins() {
        let records = vec![
            record_from([("taxpayer_id", json!("1")), ("name", json!("old"))]),
            record_from([("name", json!("no key"))]),
            record_from([("taxpayer_number", json!(" 2 ")), ("name", json!("two"))]),
            record_from([("taxpayer_id", json!("1")), ("name", json!("new"))]),
            record_from([("taxpayer_id", json!(""))]),
        ];
        let index = SourceIndex::build(records, "socrata", &key_fields(), false);

        assert_eq!(index.len(), 2);
        assert_eq!(index.skipped(), 2);
        assert_eq!(index.keys().collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(index.get("1").unwrap().fields["name"], "new");
        assert!(index.contains("2"));
    }

    #[test]
    fn test_prefixing_keeps_raw_fields() {
        let records = vec![record_from([("id", json!(7)), ("name", json!("Acme"))])];
        let index = SourceIndex::build(records, "comptroller", &key_fields(), true);

        let entry = index.get("7").unwrap();
        assert_eq!(entry.fields["comptroller_name"], "Acme");
        assert_eq!(entry.fields["comptroller_id"], 7);
        assert!(!entry.fields.contains_key("name"));
        assert_eq!(entry.raw["name"], "Acme");
        assert_eq!(entry.source, "comptroller");
    }
}
