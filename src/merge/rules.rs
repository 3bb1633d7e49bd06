//! Conflict rules applied after the priority merge.
//!
//! Each rule reads the candidate records of one key (highest priority first)
//! and writes derived `resolved_*` fields into the merged record.

use serde_json::Value;

use super::index::IndexedRecord;
use crate::models::{is_empty_value, value_text, Record};

/// Resolves one family of conflicting fields.
pub trait ConflictRule: Send + Sync {
    fn name(&self) -> &str;

    /// `candidates` are the records of one key, highest priority first.
    fn resolve(&self, candidates: &[&IndexedRecord], merged: &mut Record);
}

/// First non-empty value among `fields` in a candidate's raw record.
fn first_value<'a>(candidate: &'a IndexedRecord, fields: &[String]) -> Option<&'a Value> {
    fields
        .iter()
        .filter_map(|f| candidate.raw.get(f))
        .find(|v| !is_empty_value(v))
}

/// Candidates in `order`; an empty order means priority order.
fn ordered<'a>(candidates: &[&'a IndexedRecord], order: &[String]) -> Vec<&'a IndexedRecord> {
    if order.is_empty() {
        return candidates.to_vec();
    }
    order
        .iter()
        .filter_map(|source| candidates.iter().find(|c| &c.source == source).copied())
        .collect()
}

/// The longest non-empty value of any listed field wins.
/// Ties go to the higher-priority source.
#[derive(Debug, Clone)]
pub struct LongestValue {
    pub fields: Vec<String>,
    pub output: String,
}

impl ConflictRule for LongestValue {
    fn name(&self) -> &str {
        "longest-value"
    }

    fn resolve(&self, candidates: &[&IndexedRecord], merged: &mut Record) {
        let mut best: Option<(usize, &Value)> = None;
        for candidate in candidates {
            for field in &self.fields {
                let Some(value) = candidate.raw.get(field).filter(|v| !is_empty_value(v)) else {
                    continue;
                };
                let len = value_text(value).chars().count();
                if best.map_or(true, |(best_len, _)| len > best_len) {
                    best = Some((len, value));
                }
            }
        }
        if let Some((_, value)) = best {
            merged.insert(self.output.clone(), value.clone());
        }
    }
}

/// The first source in a fixed order that has any listed field wins.
/// The winning source is recorded alongside the value.
#[derive(Debug, Clone)]
pub struct FirstBySourceOrder {
    pub fields: Vec<String>,
    pub order: Vec<String>,
    pub output: String,
    pub source_output: String,
}

impl ConflictRule for FirstBySourceOrder {
    fn name(&self) -> &str {
        "first-by-source-order"
    }

    fn resolve(&self, candidates: &[&IndexedRecord], merged: &mut Record) {
        let winner = ordered(candidates, &self.order)
            .into_iter()
            .find_map(|c| first_value(c, &self.fields).map(|v| (c, v)));
        if let Some((candidate, value)) = winner {
            merged.insert(self.output.clone(), value.clone());
            merged.insert(
                self.source_output.clone(),
                Value::String(candidate.source.clone()),
            );
        }
    }
}

/// Each listed field is resolved independently from the first source in a
/// fixed order that has it, into `<prefix><field>`.
#[derive(Debug, Clone)]
pub struct PerFieldSourceOrder {
    pub fields: Vec<String>,
    pub order: Vec<String>,
    pub prefix: String,
}

impl ConflictRule for PerFieldSourceOrder {
    fn name(&self) -> &str {
        "per-field-source-order"
    }

    fn resolve(&self, candidates: &[&IndexedRecord], merged: &mut Record) {
        let ordered = ordered(candidates, &self.order);
        for field in &self.fields {
            let value = ordered
                .iter()
                .filter_map(|c| c.raw.get(field))
                .find(|v| !is_empty_value(v));
            if let Some(value) = value {
                merged.insert(format!("{}{}", self.prefix, field), value.clone());
            }
        }
    }
}

/// Named rule bundles.
pub struct ConflictRules;

impl ConflictRules {
    /// Business entity rules: longest name, address by source order, dates per
    /// field by source order.
    pub fn business_entity(order: Vec<String>) -> Vec<Box<dyn ConflictRule>> {
        let strings = |fields: &[&str]| fields.iter().map(|f| f.to_string()).collect::<Vec<_>>();
        vec![
            Box::new(LongestValue {
                fields: strings(&["name", "business_name", "taxpayer_name", "legal_name"]),
                output: "resolved_business_name".to_string(),
            }) as Box<dyn ConflictRule>,
            Box::new(FirstBySourceOrder {
                fields: strings(&["address", "street_address", "taxpayer_address"]),
                order: order.clone(),
                output: "resolved_address".to_string(),
                source_output: "resolved_address_source".to_string(),
            }) as Box<dyn ConflictRule>,
            Box::new(PerFieldSourceOrder {
                fields: strings(&["filing_date", "registration_date", "effective_date"]),
                order,
                prefix: "resolved_".to_string(),
            }) as Box<dyn ConflictRule>,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record_from;
    use serde_json::json;

    fn candidate(source: &str, raw: Record) -> IndexedRecord {
        IndexedRecord {
            key: "1".into(),
            source: source.into(),
            fields: raw.clone(),
            raw,
        }
    }

    #[test]
    fn test_longest_value_tie_goes_to_priority() {
        let high = candidate("high", record_from([("name", json!("ABCD"))]));
        let low = candidate("low", record_from([("legal_name", json!("WXYZ"))]));
        let rule = LongestValue {
            fields: vec!["name".into(), "legal_name".into()],
            output: "resolved_name".into(),
        };

        let mut merged = Record::new();
        rule.resolve(&[&high, &low], &mut merged);
        assert_eq!(merged["resolved_name"], "ABCD");

        let longer = candidate("low", record_from([("legal_name", json!("WXYZ Inc"))]));
        rule.resolve(&[&high, &longer], &mut merged);
        assert_eq!(merged["resolved_name"], "WXYZ Inc");
    }

    #[test]
    fn test_first_by_source_order_skips_empty_values() {
        let a = candidate("a", record_from([("address", json!(" "))]));
        let b = candidate("b", record_from([("street_address", json!("9 Elm"))]));
        let rule = FirstBySourceOrder {
            fields: vec!["address".into(), "street_address".into()],
            order: vec!["a".into(), "b".into()],
            output: "addr".into(),
            source_output: "addr_source".into(),
        };

        let mut merged = Record::new();
        rule.resolve(&[&a, &b], &mut merged);
        assert_eq!(merged["addr"], "9 Elm");
        assert_eq!(merged["addr_source"], "b");
    }

    #[test]
    fn test_rule_leaves_record_alone_without_values() {
        let a = candidate("a", record_from([("other", json!(1))]));
        let mut merged = Record::new();
        for rule in ConflictRules::business_entity(vec!["a".into()]) {
            rule.resolve(&[&a], &mut merged);
        }
        assert!(merged.is_empty());
    }
}
