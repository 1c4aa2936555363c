//! Filters fetched batches against the warehouse keys and against each other.

use std::collections::HashSet;

use despesas_core::{
    ExistingKeySet, ExpenseRecord, FetchBatch, FiscalYear, NetNewBatch, YearCounts,
};
use serde::{Deserialize, Serialize};

/// What to do with records that carry no usable identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingIdPolicy {
    /// Pass them through; they cannot be deduplicated.
    #[default]
    Lenient,
    /// Reject them and count them as skipped.
    Strict,
}

/// One year's batch after the warehouse-key pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefilteredBatch {
    pub year: FiscalYear,
    pub records: Vec<ExpenseRecord>,
    pub counts: YearCounts,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub net_new: NetNewBatch,
    /// Per-year counts in the order the batches were merged.
    pub counts: Vec<(FiscalYear, YearCounts)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DedupResolver {
    policy: MissingIdPolicy,
}

impl DedupResolver {
    pub fn new(policy: MissingIdPolicy) -> Self {
        Self { policy }
    }

    /// Drops records already in the warehouse. Independent per year, so it can run
    /// as soon as a fetch completes.
    pub fn prefilter(&self, batch: FetchBatch, existing: &ExistingKeySet) -> PrefilteredBatch {
        let mut counts = YearCounts {
            fetched: batch.records.len(),
            ..YearCounts::default()
        };
        let mut records = Vec::with_capacity(batch.records.len());

        for record in batch.records {
            match record.internal_code.as_deref() {
                Some(code) if existing.contains(code) => counts.rejected_existing += 1,
                Some(_) => records.push(record),
                None => match self.policy {
                    MissingIdPolicy::Strict => counts.skipped_no_id += 1,
                    MissingIdPolicy::Lenient => {
                        counts.passed_without_id += 1;
                        records.push(record);
                    }
                },
            }
        }

        PrefilteredBatch {
            year: batch.year,
            records,
            counts,
        }
    }

    /// Concatenates prefiltered batches in the given order and drops repeats of a
    /// code already seen earlier in the run. Must be called with batches in the
    /// configured year order, never completion order.
    pub fn merge(&self, batches: Vec<PrefilteredBatch>) -> Resolution {
        let mut seen: HashSet<String> = HashSet::new();
        let mut survivors = Vec::new();
        let mut counts = Vec::with_capacity(batches.len());

        for batch in batches {
            let mut year_counts = batch.counts;
            for record in batch.records {
                let fresh = match &record.internal_code {
                    Some(code) => seen.insert(code.clone()),
                    None => true,
                };
                if fresh {
                    year_counts.net_new += 1;
                    survivors.push(record);
                } else {
                    year_counts.rejected_intra_run += 1;
                }
            }
            counts.push((batch.year, year_counts));
        }

        Resolution {
            net_new: NetNewBatch::new(survivors),
            counts,
        }
    }

    pub fn resolve(&self, batches: Vec<FetchBatch>, existing: &ExistingKeySet) -> Resolution {
        let prefiltered = batches
            .into_iter()
            .map(|batch| self.prefilter(batch, existing))
            .collect();
        self.merge(prefiltered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn year(y: i32) -> FiscalYear {
        FiscalYear::new(y).expect("year")
    }

    fn record(y: i32, fields: Value) -> ExpenseRecord {
        ExpenseRecord::stamped(
            fields.as_object().cloned().expect("object"),
            year(y),
            "codigo_interno",
            "ano_api",
        )
    }

    fn batch(y: i32, codes: &[Value]) -> FetchBatch {
        FetchBatch {
            year: year(y),
            records: codes
                .iter()
                .map(|code| record(y, json!({ "codigo_interno": code })))
                .collect(),
        }
    }

    fn codes(resolution: &Resolution) -> Vec<(String, i32)> {
        resolution
            .net_new
            .records()
            .iter()
            .map(|r| (r.internal_code.clone().unwrap_or_default(), r.fiscal_year.get()))
            .collect()
    }

    #[test]
    fn existing_and_cross_year_duplicates_are_dropped() {
        let existing = ExistingKeySet::from_raw_keys(["A1", "A2"]);
        let resolution = DedupResolver::default().resolve(
            vec![
                batch(2025, &[json!("A1"), json!("A3")]),
                batch(2026, &[json!("A3"), json!("A4")]),
            ],
            &existing,
        );

        assert_eq!(
            codes(&resolution),
            vec![("A3".to_string(), 2025), ("A4".to_string(), 2026)]
        );
        let (_, first) = &resolution.counts[0];
        assert_eq!(first.fetched, 2);
        assert_eq!(first.rejected_existing, 1);
        assert_eq!(first.net_new, 1);
        let (_, second) = &resolution.counts[1];
        assert_eq!(second.rejected_intra_run, 1);
        assert_eq!(second.net_new, 1);
    }

    #[test]
    fn duplicates_within_one_year_keep_the_first() {
        let resolution = DedupResolver::default().resolve(
            vec![batch(2025, &[json!(7), json!("7"), json!(8)])],
            &ExistingKeySet::default(),
        );
        assert_eq!(
            codes(&resolution),
            vec![("7".to_string(), 2025), ("8".to_string(), 2025)]
        );
        assert_eq!(resolution.counts[0].1.rejected_intra_run, 1);
    }

    #[test]
    fn numeric_codes_match_string_keys_in_the_warehouse() {
        let existing = ExistingKeySet::from_raw_keys(["42"]);
        let resolution =
            DedupResolver::default().resolve(vec![batch(2025, &[json!(42)])], &existing);
        assert!(resolution.net_new.is_empty());
    }

    #[test]
    fn unkeyed_records_pass_in_lenient_mode() {
        let mut input = batch(2025, &[json!("A1")]);
        input.records.push(record(2025, json!({"historico": "sem id"})));
        input.records.push(record(2025, json!({"historico": "sem id"})));

        let resolution = DedupResolver::new(MissingIdPolicy::Lenient)
            .resolve(vec![input], &ExistingKeySet::default());
        assert_eq!(resolution.net_new.len(), 3);
        assert_eq!(resolution.counts[0].1.passed_without_id, 2);
        assert_eq!(resolution.counts[0].1.skipped_no_id, 0);
    }

    #[test]
    fn unkeyed_records_are_skipped_in_strict_mode() {
        let mut input = batch(2025, &[json!("A1")]);
        input.records.push(record(2025, json!({"codigo_interno": null})));

        let resolution = DedupResolver::new(MissingIdPolicy::Strict)
            .resolve(vec![input], &ExistingKeySet::default());
        assert_eq!(resolution.net_new.len(), 1);
        assert_eq!(resolution.counts[0].1.skipped_no_id, 1);
    }

    #[test]
    fn merge_order_decides_attribution() {
        let resolver = DedupResolver::default();
        let existing = ExistingKeySet::default();
        let a = resolver.prefilter(batch(2025, &[json!("X")]), &existing);
        let b = resolver.prefilter(batch(2026, &[json!("X")]), &existing);

        let resolution = resolver.merge(vec![b, a]);
        assert_eq!(codes(&resolution), vec![("X".to_string(), 2026)]);
    }
}
