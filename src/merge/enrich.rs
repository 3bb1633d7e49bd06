//! Record-level helpers used around a merge: field remapping and enrichment joins.

use std::collections::HashMap;

use crate::models::{normalize_key, Record};

/// Rename fields before indexing. Fields absent from a record stay absent.
pub fn remap_fields(records: Vec<Record>, mapping: &HashMap<String, String>) -> Vec<Record> {
    records
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .map(|(field, value)| match mapping.get(&field) {
                    Some(renamed) => (renamed.clone(), value),
                    None => (field, value),
                })
                .collect()
        })
        .collect()
}

/// Left join `enrichment` onto `base` by `join_field`.
///
/// Matching enrichment fields (except the join field) are added as
/// `<prefix><field>`. Base records without a match pass through unchanged.
/// Duplicate join values in `enrichment` resolve to the last record.
pub fn enrich(
    base: Vec<Record>,
    enrichment: &[Record],
    join_field: &str,
    prefix: &str,
) -> Vec<Record> {
    let index: HashMap<String, &Record> = enrichment
        .iter()
        .filter_map(|r| r.get(join_field).and_then(normalize_key).map(|k| (k, r)))
        .collect();

    base.into_iter()
        .map(|mut record| {
            let matched = record
                .get(join_field)
                .and_then(normalize_key)
                .and_then(|k| index.get(&k).copied());
            if let Some(extra) = matched {
                for (field, value) in extra {
                    if field != join_field {
                        record.insert(format!("{prefix}{field}"), value.clone());
                    }
                }
            }
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record_from;
    use serde_json::json;

    #[test]
    fn test_remap_renames_present_fields_only() {
        let mapping = HashMap::from([
            ("taxpayer_number".to_string(), "taxpayer_id".to_string()),
            ("missing".to_string(), "renamed".to_string()),
        ]);
        let out = remap_fields(
            vec![record_from([("taxpayer_number", json!("1")), ("name", json!("A"))])],
            &mapping,
        );
        assert_eq!(out[0]["taxpayer_id"], "1");
        assert_eq!(out[0]["name"], "A");
        assert!(!out[0].contains_key("taxpayer_number"));
        assert!(!out[0].contains_key("renamed"));
    }

    #[test]
    fn test_enrich_adds_prefixed_fields() {
        let base = vec![
            record_from([("taxpayer_id", json!("1")), ("name", json!("A"))]),
            record_from([("taxpayer_id", json!("2"))]),
        ];
        let extra = vec![record_from([
            ("taxpayer_id", json!(1)),
            ("county", json!("Travis")),
        ])];

        let out = enrich(base, &extra, "taxpayer_id", "enriched_");
        assert_eq!(out[0]["enriched_county"], "Travis");
        assert!(!out[0].contains_key("enriched_taxpayer_id"));
        assert_eq!(out[1].len(), 1);
    }
}
