//! Fold duplicate groups into their most complete record.
//!
//! Epistemic foundation:
//! - K_i: score = non-empty fields + 1 per string value longer than 10 chars
//! - K_i: The highest score is kept; ties go to the first record seen
//! - B_i: More populated ≈ more complete (heuristic, not correctness)

use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

use super::strategy::{DedupStats, DedupStrategy};
use crate::models::{is_empty_value, Record};

/// Field carrying the provenance count when a consolidated record is flattened.
pub const MERGED_FROM_FIELD: &str = "_merged_from_count";

/// Completeness score of a record.
pub fn completeness_score(record: &Record) -> usize {
    record
        .values()
        .filter(|v| !is_empty_value(v))
        .map(|v| match v {
            Value::String(s) if s.chars().count() > 10 => 2,
            _ => 1,
        })
        .sum()
}

/// What happens to the lower-scored records of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Fill fields missing or empty in the kept record from the others
    #[default]
    Backfill,
    /// Keep the best record as is
    KeepBest,
}

/// One output record and how many inputs were folded into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidated {
    pub record: Record,
    pub merged_from: usize,
}

impl Consolidated {
    /// Flatten, adding the provenance count for records folded from several inputs.
    pub fn into_record(self) -> Record {
        let mut record = self.record;
        if self.merged_from > 1 {
            record.insert(MERGED_FROM_FIELD.to_string(), Value::from(self.merged_from));
        }
        record
    }
}

/// Result of a merge-by-completeness pass.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: Vec<Consolidated>,
    /// Lower-scored records folded away, unmodified, in group order
    pub duplicates: Vec<Record>,
    pub stats: DedupStats,
}

/// Groups records by dedup key and folds each group into one record.
#[derive(Debug, Clone)]
pub struct CompletenessMerger {
    strategy: DedupStrategy,
    mode: MergeMode,
}

impl CompletenessMerger {
    pub fn new(strategy: DedupStrategy) -> Self {
        Self {
            strategy,
            mode: MergeMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Output order follows each group's first occurrence. Records without a
    /// dedup key pass through on their own.
    pub fn merge(&self, records: Vec<Record>) -> MergeOutcome {
        let original = records.len();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Vec<Record>> = Vec::new();

        for record in records {
            match self.strategy.dedup_key(&record) {
                Some(key) => match positions.get(&key) {
                    Some(&i) => groups[i].push(record),
                    None => {
                        positions.insert(key, groups.len());
                        groups.push(vec![record]);
                    }
                },
                None => groups.push(vec![record]),
            }
        }

        let merged_groups = groups.iter().filter(|g| g.len() > 1).count();
        let mut records = Vec::with_capacity(groups.len());
        let mut duplicates = Vec::new();
        for group in groups {
            let merged_from = group.len();
            let (record, folded) = fold_group(group, self.mode);
            records.push(Consolidated {
                record,
                merged_from,
            });
            duplicates.extend(folded);
        }

        let stats = DedupStats::new(original, records.len(), original - records.len());
        info!(
            strategy = self.strategy.name(),
            groups = merged_groups,
            original = original,
            output = records.len(),
            "Merged duplicate groups by completeness"
        );
        MergeOutcome {
            records,
            duplicates,
            stats,
        }
    }
}

/// Fold one group into its most complete record.
pub fn merge_group(group: Vec<Record>, mode: MergeMode) -> Record {
    fold_group(group, mode).0
}

/// The kept record of a group and the records folded into it.
fn fold_group(group: Vec<Record>, mode: MergeMode) -> (Record, Vec<Record>) {
    let mut scored: Vec<(usize, Record)> = group
        .into_iter()
        .map(|r| (completeness_score(&r), r))
        .collect();
    // Stable: ties keep input order
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let mut ranked = scored.into_iter().map(|(_, r)| r);
    let Some(mut kept) = ranked.next() else {
        return (Record::new(), Vec::new());
    };
    let rest: Vec<Record> = ranked.collect();

    if mode == MergeMode::Backfill {
        for other in &rest {
            for (field, value) in other {
                let fill = match kept.get(field) {
                    None => true,
                    Some(current) => is_empty_value(current) && !is_empty_value(value),
                };
                if fill {
                    kept.insert(field.clone(), value.clone());
                }
            }
        }
    }
    (kept, rest)
}
