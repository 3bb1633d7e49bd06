//! Consolidation pipeline.
//!
//! Flow: Dedup each source → Index by key → Combine by priority →
//! Residual dedup of the merged set

use serde::Serialize;
use tracing::info;

use crate::dedup::{CompletenessMerger, DedupStats, DedupStrategy, Deduplicator};
use crate::merge::{CombineStats, Combiner, ConflictRules, FieldPriority, SourceIndex};
use crate::models::{Config, KeyFields, Record, Result};
use crate::transform::{BulkTransform, FallbackTransform};

/// Per-source counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub input: usize,
    pub duplicates: usize,
    /// Records without a usable key
    pub skipped: usize,
    pub indexed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    #[serde(skip)]
    pub records: Vec<Record>,
    pub sources: Vec<SourceSummary>,
    pub combine: CombineStats,
    pub residual: DedupStats,
}

/// Turns several keyed record sets into one deduplicated set.
pub struct Consolidator {
    key_fields: KeyFields,
    strategy: DedupStrategy,
    combiner: Combiner,
    prefix: bool,
    output_key: String,
    merge_duplicates: bool,
    transform: FallbackTransform,
}

impl Consolidator {
    pub fn new(key_fields: KeyFields, combiner: Combiner) -> Self {
        Self {
            strategy: DedupStrategy::Identity(key_fields.clone()),
            key_fields,
            combiner,
            prefix: true,
            output_key: "key".to_string(),
            merge_duplicates: false,
            transform: FallbackTransform::cpu(),
        }
    }

    /// Build from the `[merge]` and `[dedup]` sections. `smart` adds the
    /// business entity conflict rules.
    pub fn from_config(config: &Config, smart: bool) -> Self {
        let key_fields = KeyFields::new(config.merge.key_fields.iter().cloned());
        let mut combiner = Combiner::new(FieldPriority::new(config.merge.field_priority.iter().cloned()));
        if smart {
            combiner = combiner.with_rules(ConflictRules::business_entity(Vec::new()));
        }
        let strategy = DedupStrategy::from_config(&config.dedup, &key_fields);

        Self::new(key_fields, combiner)
            .with_strategy(strategy)
            .with_prefix(config.merge.prefix_fields)
            .with_output_key(&config.merge.output_key)
            .with_merge_duplicates(config.dedup.merge)
    }

    pub fn with_strategy(mut self, strategy: DedupStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Prefix source fields with `<source>_`.
    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_output_key(mut self, output_key: &str) -> Self {
        self.output_key = output_key.to_string();
        self
    }

    /// Fold duplicates by completeness instead of dropping them.
    pub fn with_merge_duplicates(mut self, merge: bool) -> Self {
        self.merge_duplicates = merge;
        self
    }

    pub fn with_transform(mut self, transform: FallbackTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Consolidate `(source name, records)` pairs. Argument order decides
    /// output key order and the rank of sources missing from the priority.
    pub fn run(&self, sources: Vec<(String, Vec<Record>)>) -> Result<ConsolidationReport> {
        let mut summaries = Vec::with_capacity(sources.len());
        let mut indexes = Vec::with_capacity(sources.len());

        for (source, records) in sources {
            let input = records.len();
            let outcome = Deduplicator::new(self.strategy.clone()).deduplicate(records);
            let index = SourceIndex::build(outcome.unique, &source, &self.key_fields, self.prefix);
            summaries.push(SourceSummary {
                source,
                input,
                duplicates: outcome.stats.duplicates,
                skipped: index.skipped(),
                indexed: index.len(),
            });
            indexes.push(index);
        }

        let merged = self.combiner.combine(&indexes);
        let combine = CombineStats::from_merged(&merged);
        let flat: Vec<Record> = merged.iter().map(|m| m.to_record(&self.output_key)).collect();

        let (records, residual) = self.residual_dedup(flat)?;

        info!(
            sources = summaries.len(),
            merged = combine.total_records,
            with_all_sources = combine.with_all_sources,
            output = records.len(),
            "Consolidation complete"
        );
        Ok(ConsolidationReport {
            records,
            sources: summaries,
            combine,
            residual,
        })
    }

    fn residual_dedup(&self, records: Vec<Record>) -> Result<(Vec<Record>, DedupStats)> {
        let output_key = KeyFields::single(self.output_key.as_str());
        let strategy = match &self.strategy {
            DedupStrategy::Identity(_) => DedupStrategy::Identity(output_key.clone()),
            other => other.clone(),
        };

        if self.merge_duplicates {
            let outcome = CompletenessMerger::new(strategy).merge(records);
            let records = outcome.records.into_iter().map(|c| c.into_record()).collect();
            return Ok((records, outcome.stats));
        }

        let original = records.len();
        let unique = match strategy {
            DedupStrategy::Identity(_) => self.transform.dedupe_by_key(&records, &output_key)?,
            other => Deduplicator::new(other).deduplicate(records).unique,
        };
        let stats = DedupStats::new(original, unique.len(), original - unique.len());
        Ok((unique, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record_from;
    use serde_json::json;

    fn sources() -> Vec<(String, Vec<Record>)> {
        vec![
            (
                "comptroller".to_string(),
                vec![
                    record_from([("taxpayer_id", json!("1")), ("name", json!("Acme"))]),
                    record_from([("taxpayer_id", json!("1")), ("name", json!("Acme dup"))]),
                    record_from([("taxpayer_id", json!("2")), ("name", json!("Beta"))]),
                    record_from([("name", json!("no key"))]),
                ],
            ),
            (
                "sos".to_string(),
                vec![
                    record_from([("id", json!(" 2")), ("status", json!("Active"))]),
                    record_from([("id", json!("3")), ("status", json!("Forfeited"))]),
                ],
            ),
        ]
    }

    fn consolidator() -> Consolidator {
        Consolidator::new(
            KeyFields::new(["taxpayer_id", "id"]),
            Combiner::new(FieldPriority::new(["comptroller", "sos"])),
        )
    }

    #[test]
    fn test_consolidates_sources_by_key() {
        let report = consolidator().with_prefix(false).run(sources()).unwrap();

        assert_eq!(report.records.len(), 3);
        assert_eq!(report.sources[0].duplicates, 1);
        assert_eq!(report.sources[0].skipped, 1);
        assert_eq!(report.sources[1].indexed, 2);

        let two = report.records.iter().find(|r| r["key"] == "2").unwrap();
        assert_eq!(two["name"], "Beta");
        assert_eq!(two["status"], "Active");
        assert_eq!(two["has_comptroller"], true);
        assert_eq!(two["has_sos"], true);
        assert_eq!(report.combine.with_all_sources, 1);
        assert_eq!(report.residual.duplicates, 0);
    }

    #[test]
    fn test_prefixed_output_key() {
        let report = consolidator().with_output_key("taxpayer").run(sources()).unwrap();
        let one = report.records.iter().find(|r| r["taxpayer"] == "1").unwrap();
        assert_eq!(one["comptroller_name"], "Acme");
        assert_eq!(one["has_sos"], false);
    }

    #[test]
    fn test_fuzzy_strategy_applies_per_source() {
        let sources = vec![(
            "a".to_string(),
            vec![
                record_from([("id", json!("1")), ("name", json!("Acme"))]),
                record_from([("id", json!("2")), ("name", json!("ACME ")), ("phone", json!("555"))]),
            ],
        )];
        let report = Consolidator::new(KeyFields::single("id"), Combiner::new(FieldPriority::default()))
            .with_prefix(false)
            .with_strategy(DedupStrategy::Fuzzy(vec!["name".to_string()]))
            .with_merge_duplicates(true)
            .run(sources)
            .unwrap();

        // Per-source fuzzy dedup already drops the second record
        assert_eq!(report.sources[0].duplicates, 1);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0]["key"], "1");
    }

    #[test]
    fn test_from_config_applies_sections() {
        let mut config = Config::default();
        config.merge.key_fields = vec!["taxpayer_id".into(), "id".into()];
        config.merge.prefix_fields = false;
        config.merge.field_priority = vec!["sos".into()];

        let report = Consolidator::from_config(&config, true).run(sources()).unwrap();
        let two = report.records.iter().find(|r| r["key"] == "2").unwrap();
        assert_eq!(two["resolved_business_name"], "Beta");
        assert_eq!(two["status"], "Active");
    }
}
