//! Bulk key transforms with a mandatory CPU fallback.
//!
//! Epistemic foundation:
//! - K_i: `CpuTransform` is the reference behaviour of every implementation
//! - B_i: An accelerated implementation may fail at runtime → Result
//! - I^B: Accelerator availability is unknowable until tried, so
//!   `FallbackTransform` always has the CPU path behind it

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{KeyFields, Record, Result};

/// Deduplicate and merge record sets by business key.
pub trait BulkTransform: Send + Sync {
    fn name(&self) -> &str;

    /// Keep the first record per key. Unkeyed records stay in place.
    fn dedupe_by_key(&self, records: &[Record], key_fields: &KeyFields) -> Result<Vec<Record>>;

    /// Outer join by key. Right fields overlay left fields.
    fn merge_by_key(
        &self,
        left: &[Record],
        right: &[Record],
        key_fields: &KeyFields,
    ) -> Result<Vec<Record>>;
}

/// Reference implementation on plain collections.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTransform;

impl BulkTransform for CpuTransform {
    fn name(&self) -> &str {
        "cpu"
    }

    fn dedupe_by_key(&self, records: &[Record], key_fields: &KeyFields) -> Result<Vec<Record>> {
        let mut seen = HashSet::new();
        Ok(records
            .iter()
            .filter(|r| match key_fields.extract(r) {
                Some(key) => seen.insert(key),
                None => true,
            })
            .cloned()
            .collect())
    }

    fn merge_by_key(
        &self,
        left: &[Record],
        right: &[Record],
        key_fields: &KeyFields,
    ) -> Result<Vec<Record>> {
        let mut order: Vec<String> = Vec::new();
        let mut merged: HashMap<String, Record> = HashMap::new();
        let mut right_side: HashMap<String, &Record> = HashMap::new();
        let mut unkeyed: Vec<Record> = Vec::new();

        // Left side, last write wins
        for record in left {
            match key_fields.extract(record) {
                Some(key) => {
                    if merged.insert(key.clone(), record.clone()).is_none() {
                        order.push(key);
                    }
                }
                None => unkeyed.push(record.clone()),
            }
        }

        // Right side, last write wins
        let mut right_unkeyed = Vec::new();
        for record in right {
            match key_fields.extract(record) {
                Some(key) => {
                    if right_side.insert(key.clone(), record).is_none() && !merged.contains_key(&key) {
                        order.push(key);
                    }
                }
                None => right_unkeyed.push(record.clone()),
            }
        }

        for (key, record) in right_side {
            let entry = merged.entry(key).or_default();
            for (field, value) in record {
                entry.insert(field.clone(), value.clone());
            }
        }

        let mut out: Vec<Record> = order
            .into_iter()
            .filter_map(|key| merged.remove(&key))
            .collect();
        out.extend(unkeyed);
        out.extend(right_unkeyed);
        Ok(out)
    }
}

/// Uses an accelerated implementation when one is injected, falling back to
/// [`CpuTransform`] when it is absent or fails.
#[derive(Clone, Default)]
pub struct FallbackTransform {
    accelerated: Option<Arc<dyn BulkTransform>>,
}

impl FallbackTransform {
    /// CPU only.
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn with_accelerated(accelerated: Arc<dyn BulkTransform>) -> Self {
        Self {
            accelerated: Some(accelerated),
        }
    }

    pub fn is_accelerated(&self) -> bool {
        self.accelerated.is_some()
    }

    fn run<T>(
        &self,
        operation: &str,
        accelerated: impl FnOnce(&dyn BulkTransform) -> Result<T>,
        cpu: impl FnOnce(&CpuTransform) -> Result<T>,
    ) -> Result<T> {
        if let Some(imp) = &self.accelerated {
            match accelerated(imp.as_ref()) {
                Ok(out) => {
                    debug!(implementation = imp.name(), operation = operation, "Bulk transform done");
                    return Ok(out);
                }
                Err(e) => warn!(
                    implementation = imp.name(),
                    operation = operation,
                    error = %e,
                    "Accelerated transform failed, falling back to CPU"
                ),
            }
        }
        cpu(&CpuTransform)
    }
}

impl BulkTransform for FallbackTransform {
    fn name(&self) -> &str {
        match &self.accelerated {
            Some(imp) => imp.name(),
            None => "cpu",
        }
    }

    fn dedupe_by_key(&self, records: &[Record], key_fields: &KeyFields) -> Result<Vec<Record>> {
        self.run(
            "dedupe_by_key",
            |imp| imp.dedupe_by_key(records, key_fields),
            |cpu| cpu.dedupe_by_key(records, key_fields),
        )
    }

    fn merge_by_key(
        &self,
        left: &[Record],
        right: &[Record],
        key_fields: &KeyFields,
    ) -> Result<Vec<Record>> {
        self.run(
            "merge_by_key",
            |imp| imp.merge_by_key(left, right, key_fields),
            |cpu| cpu.merge_by_key(left, right, key_fields),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{record_from, HarvestError};
    use serde_json::json;

    /// Accelerator stand-in that always fails.
    struct Broken;

    impl BulkTransform for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn dedupe_by_key(&self, _: &[Record], _: &KeyFields) -> Result<Vec<Record>> {
            Err(HarvestError::Transform {
                name: "broken".into(),
                message: "device lost".into(),
            })
        }

        fn merge_by_key(&self, _: &[Record], _: &[Record], _: &KeyFields) -> Result<Vec<Record>> {
            Err(HarvestError::Transform {
                name: "broken".into(),
                message: "device lost".into(),
            })
        }
    }

    fn key() -> KeyFields {
        KeyFields::single("id")
    }

    fn sample() -> Vec<Record> {
        vec![
            record_from([("id", json!("1")), ("v", json!("a"))]),
            record_from([("v", json!("unkeyed"))]),
            record_from([("id", json!("1")), ("v", json!("b"))]),
            record_from([("id", json!("2")), ("v", json!("c"))]),
        ]
    }

    #[test]
    fn test_cpu_dedupe_keeps_first_and_unkeyed() {
        let out = CpuTransform.dedupe_by_key(&sample(), &key()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["v"], "a");
        assert_eq!(out[1]["v"], "unkeyed");
        assert_eq!(out[2]["v"], "c");
    }

    #[test]
    fn test_cpu_merge_is_outer_join() {
        let left = vec![
            record_from([("id", json!("1")), ("name", json!("X")), ("v", json!("left"))]),
            record_from([("id", json!("2")), ("name", json!("Y"))]),
        ];
        let right = vec![
            record_from([("id", json!("1")), ("status", json!("Active")), ("v", json!("right"))]),
            record_from([("id", json!("3")), ("status", json!("Closed"))]),
            record_from([("note", json!("unkeyed"))]),
        ];

        let out = CpuTransform.merge_by_key(&left, &right, &key()).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0]["name"], "X");
        assert_eq!(out[0]["status"], "Active");
        assert_eq!(out[0]["v"], "right");
        assert_eq!(out[1]["id"], "2");
        assert_eq!(out[2]["id"], "3");
        assert_eq!(out[3]["note"], "unkeyed");
    }

    #[test]
    fn test_fallback_matches_cpu_when_accelerator_fails() {
        let fallback = FallbackTransform::with_accelerated(Arc::new(Broken));
        assert!(fallback.is_accelerated());

        let records = sample();
        assert_eq!(
            fallback.dedupe_by_key(&records, &key()).unwrap(),
            CpuTransform.dedupe_by_key(&records, &key()).unwrap()
        );
        assert_eq!(
            fallback.merge_by_key(&records, &records, &key()).unwrap(),
            CpuTransform.merge_by_key(&records, &records, &key()).unwrap()
        );
    }

    #[test]
    fn test_fallback_uses_accelerator_when_it_works() {
        let fallback = FallbackTransform::with_accelerated(Arc::new(CpuTransform));
        assert_eq!(fallback.name(), "cpu");
        let out = fallback.dedupe_by_key(&sample(), &key()).unwrap();
        assert_eq!(out.len(), 3);

        let plain = FallbackTransform::cpu();
        assert!(!plain.is_accelerated());
        assert_eq!(plain.dedupe_by_key(&sample(), &key()).unwrap(), out);
    }
}
