//! Core data model for the expense ingestion pipeline.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "despesas-core";

/// Ordered field map of one upstream record. The upstream field set is not fixed.
pub type RecordFields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiscalYearError {
    #[error("fiscal year {year} is outside the operational range {min}..={max}")]
    OutOfRange { year: i32, min: i32, max: i32 },
    #[error("invalid fiscal year {0:?}")]
    Invalid(String),
}

/// Four-digit calendar year partitioning API requests and record attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct FiscalYear(i32);

impl FiscalYear {
    pub const MIN: i32 = 2000;
    pub const MAX: i32 = 2099;

    pub fn new(year: i32) -> Result<Self, FiscalYearError> {
        if (Self::MIN..=Self::MAX).contains(&year) {
            Ok(Self(year))
        } else {
            Err(FiscalYearError::OutOfRange {
                year,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl TryFrom<i32> for FiscalYear {
    type Error = FiscalYearError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FiscalYear> for i32 {
    fn from(value: FiscalYear) -> Self {
        value.0
    }
}

impl FromStr for FiscalYear {
    type Err = FiscalYearError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let year: i32 = trimmed
            .parse()
            .map_err(|_| FiscalYearError::Invalid(trimmed.to_string()))?;
        Self::new(year)
    }
}

impl fmt::Display for FiscalYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Drops repeated years, keeping the first occurrence of each.
pub fn dedup_years(years: impl IntoIterator<Item = FiscalYear>) -> Vec<FiscalYear> {
    let mut seen = HashSet::new();
    years.into_iter().filter(|year| seen.insert(*year)).collect()
}

/// Canonical text form of an identifier as stored by the warehouse.
///
/// Returns `None` when nothing usable remains after trimming.
pub fn canonical_key_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Canonical string form of an identifier as returned by the API.
///
/// The API and the warehouse disagree on native types (`42` vs `"42"`), so every
/// dedup comparison goes through this. Integral floats collapse to integer text.
/// Booleans, nulls and containers are not identifiers.
pub fn canonical_internal_code(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => canonical_key_text(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                    Some((f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

/// One raw expense line as returned by the API for a fiscal year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    pub fiscal_year: FiscalYear,
    /// Canonicalized dedup key, absent when the payload carries none.
    pub internal_code: Option<String>,
    pub fields: RecordFields,
}

impl ExpenseRecord {
    /// Builds a record fetched under `year`, writing the year into `stamp_field`.
    pub fn stamped(
        mut fields: RecordFields,
        year: FiscalYear,
        id_field: &str,
        stamp_field: &str,
    ) -> Self {
        let internal_code = fields.get(id_field).and_then(canonical_internal_code);
        fields.insert(stamp_field.to_string(), Value::from(year.get()));
        Self {
            fiscal_year: year,
            internal_code,
            fields,
        }
    }
}

/// Records returned for one fiscal year in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchBatch {
    pub year: FiscalYear,
    pub records: Vec<ExpenseRecord>,
}

impl FetchBatch {
    pub fn empty(year: FiscalYear) -> Self {
        Self {
            year,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Canonical identifiers already present in the target table. Immutable for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingKeySet {
    keys: HashSet<String>,
}

impl ExistingKeySet {
    pub fn from_raw_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .filter_map(|k| canonical_key_text(k.as_ref()))
                .collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Records surviving warehouse-level and intra-run dedup, in year order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetNewBatch {
    records: Vec<ExpenseRecord>,
}

impl NetNewBatch {
    pub fn new(records: Vec<ExpenseRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ExpenseRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDegradeReason {
    TableMissing,
    QueryFailed,
    TimedOut,
}

/// The existing-key query could not be answered; the run proceeded with an empty index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedIndexWarning {
    pub reason: IndexDegradeReason,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearFailureKind {
    Transport,
    ApiLogical,
    Payload,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearFailure {
    pub kind: YearFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearCounts {
    pub fetched: usize,
    pub rejected_existing: usize,
    pub rejected_intra_run: usize,
    pub skipped_no_id: usize,
    pub passed_without_id: usize,
    pub net_new: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearReport {
    pub year: FiscalYear,
    #[serde(flatten)]
    pub counts: YearCounts,
    pub failure: Option<YearFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

/// Summary of one pipeline execution, for logging and alerting by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRunResult {
    pub run_id: Uuid,
    pub table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub years: Vec<YearReport>,
    pub existing_keys: usize,
    pub index_warning: Option<DegradedIndexWarning>,
    pub rows_appended: u64,
    pub load_error: Option<String>,
}

impl IngestionRunResult {
    pub fn start(run_id: Uuid, table: impl Into<String>, years: &[FiscalYear]) -> Self {
        Self {
            run_id,
            table: table.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            years: years
                .iter()
                .map(|&year| YearReport {
                    year,
                    counts: YearCounts::default(),
                    failure: None,
                })
                .collect(),
            existing_keys: 0,
            index_warning: None,
            rows_appended: 0,
            load_error: None,
        }
    }

    pub fn year_mut(&mut self, year: FiscalYear) -> Option<&mut YearReport> {
        self.years.iter_mut().find(|r| r.year == year)
    }

    pub fn record_failure(&mut self, year: FiscalYear, kind: YearFailureKind, message: String) {
        if let Some(report) = self.year_mut(year) {
            report.failure = Some(YearFailure { kind, message });
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (FiscalYear, &YearFailure)> {
        self.years
            .iter()
            .filter_map(|r| r.failure.as_ref().map(|f| (r.year, f)))
    }

    pub fn failed_years(&self) -> usize {
        self.failures().count()
    }

    pub fn total(&self, pick: impl Fn(&YearCounts) -> usize) -> usize {
        self.years.iter().map(|r| pick(&r.counts)).sum()
    }

    /// Marks the run finished after a successful (possibly no-op) load.
    pub fn finish_loaded(&mut self, rows_appended: u64) {
        self.rows_appended = rows_appended;
        self.status = if self.failed_years() == 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Partial
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_failed(&mut self, cause: impl Into<String>) {
        self.load_error = Some(cause.into());
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    /// Cancelled before the append was submitted; nothing was written.
    pub fn finish_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}
