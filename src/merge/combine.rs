//! Combine source indexes into one merged record per key.
//!
//! Epistemic foundation:
//! - K_i: Output keys = union of the index keys, each exactly once
//! - K_i: Fields are applied lowest priority first, so the highest-priority
//!   source wins field conflicts
//! - K_i: `has_<source>` flags follow index membership, not priority
//! - I^R: Source priority and conflict rules are configurable

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use super::index::{IndexedRecord, SourceIndex};
use super::rules::ConflictRule;
use crate::models::Record;

/// Source names ordered from highest to lowest priority.
///
/// Unlisted sources rank below listed ones, in argument order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPriority(Vec<String>);

impl FieldPriority {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(sources.into_iter().map(Into::into).collect())
    }

    /// Order `indexes` from highest to lowest priority.
    fn rank<'a>(&self, indexes: &'a [SourceIndex]) -> Vec<&'a SourceIndex> {
        let mut ranked: Vec<(usize, usize, &SourceIndex)> = indexes
            .iter()
            .enumerate()
            .map(|(position, index)| {
                let listed = self
                    .0
                    .iter()
                    .position(|s| s == index.source())
                    .unwrap_or(usize::MAX);
                (listed, position, index)
            })
            .collect();
        ranked.sort_by_key(|(listed, position, _)| (*listed, *position));
        ranked.into_iter().map(|(_, _, index)| index).collect()
    }
}

/// Whether a source contributed to a merged record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFlag {
    pub source: String,
    pub present: bool,
}

/// One merged record.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub key: String,
    pub fields: Record,
    /// Every combined source in priority order
    pub sources: Vec<SourceFlag>,
}

impl MergedRecord {
    pub fn has_source(&self, source: &str) -> bool {
        self.sources.iter().any(|f| f.source == source && f.present)
    }

    /// Flatten into a record with the key under `key_field` and one
    /// `has_<source>` flag per source. Key and flags override source fields.
    pub fn to_record(&self, key_field: &str) -> Record {
        let mut record = self.fields.clone();
        record.insert(key_field.to_string(), Value::String(self.key.clone()));
        for flag in &self.sources {
            record.insert(format!("has_{}", flag.source), Value::Bool(flag.present));
        }
        record
    }
}

/// Merges source indexes by key.
pub struct Combiner {
    priority: FieldPriority,
    rules: Vec<Box<dyn ConflictRule>>,
}

impl Combiner {
    pub fn new(priority: FieldPriority) -> Self {
        Self {
            priority,
            rules: Vec::new(),
        }
    }

    /// Add a conflict rule, applied after the priority merge.
    pub fn with_rule(mut self, rule: Box<dyn ConflictRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Box<dyn ConflictRule>>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Merge two sources.
    pub fn combine_pair(&self, a: &SourceIndex, b: &SourceIndex) -> Vec<MergedRecord> {
        self.combine(&[a.clone(), b.clone()])
    }

    /// Merge any number of sources. Keys come out in first-seen order across
    /// the indexes in argument order.
    pub fn combine(&self, indexes: &[SourceIndex]) -> Vec<MergedRecord> {
        let ranked = self.priority.rank(indexes);

        let mut seen = HashSet::new();
        let keys: Vec<&str> = indexes
            .iter()
            .flat_map(|index| index.keys())
            .filter(|key| seen.insert(*key))
            .collect();

        let merged: Vec<MergedRecord> = keys.iter().map(|key| self.merge_key(key, &ranked)).collect();

        info!(
            sources = indexes.len(),
            keys = merged.len(),
            rules = self.rules.len(),
            "Combined sources"
        );
        merged
    }

    fn merge_key(&self, key: &str, ranked: &[&SourceIndex]) -> MergedRecord {
        // Highest priority first
        let candidates: Vec<&IndexedRecord> =
            ranked.iter().filter_map(|index| index.get(key)).collect();

        let mut fields = Record::new();
        for candidate in candidates.iter().rev() {
            for (field, value) in &candidate.fields {
                fields.insert(field.clone(), value.clone());
            }
        }

        for rule in &self.rules {
            rule.resolve(&candidates, &mut fields);
        }

        let sources = ranked
            .iter()
            .map(|index| SourceFlag {
                source: index.source().to_string(),
                present: index.contains(key),
            })
            .collect();

        MergedRecord {
            key: key.to_string(),
            fields,
            sources,
        }
    }
}

/// Source coverage of a merged dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombineStats {
    pub total_records: usize,
    /// Records each source contributed to
    pub with_source: BTreeMap<String, usize>,
    /// Records only this source contributed to
    pub only_source: BTreeMap<String, usize>,
    pub with_all_sources: usize,
    /// Percentage of records each source contributed to
    pub coverage: BTreeMap<String, f64>,
    pub coverage_all: f64,
}

impl CombineStats {
    pub fn from_merged(merged: &[MergedRecord]) -> Self {
        let mut stats = Self {
            total_records: merged.len(),
            ..Default::default()
        };

        for record in merged {
            let present: Vec<&str> = record
                .sources
                .iter()
                .filter(|f| f.present)
                .map(|f| f.source.as_str())
                .collect();

            for flag in &record.sources {
                stats.with_source.entry(flag.source.clone()).or_insert(0);
                stats.only_source.entry(flag.source.clone()).or_insert(0);
            }
            for source in &present {
                *stats.with_source.entry(source.to_string()).or_insert(0) += 1;
            }
            if let [only] = present.as_slice() {
                *stats.only_source.entry(only.to_string()).or_insert(0) += 1;
            }
            if present.len() == record.sources.len() {
                stats.with_all_sources += 1;
            }
        }

        let percent = |count: usize| {
            if stats.total_records == 0 {
                0.0
            } else {
                count as f64 / stats.total_records as f64 * 100.0
            }
        };
        stats.coverage = stats
            .with_source
            .iter()
            .map(|(source, count)| (source.clone(), percent(*count)))
            .collect();
        stats.coverage_all = percent(stats.with_all_sources);
        stats
    }
}
