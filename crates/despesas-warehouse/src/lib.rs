//! Warehouse read/write contract: the existing-key index and the append-only loader.
//!
//! The append issued by [`WarehouseLoader`] is the only mutation the pipeline makes,
//! so re-running a whole run after a failure re-derives the key set and cannot
//! double-append rows that already landed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use despesas_core::{
    DegradedIndexWarning, ExistingKeySet, ExpenseRecord, IndexDegradeReason, NetNewBatch,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod parquet_dir;
pub mod postgres;

pub use parquet_dir::ParquetTableWarehouse;
pub use postgres::PostgresWarehouse;

pub const CRATE_NAME: &str = "despesas-warehouse";

/// Metadata columns every backend writes ahead of the record payload.
pub const METADATA_COLUMNS: [&str; 4] = ["internal_code", "fiscal_year", "run_id", "loaded_at"];

/// `[schema.]table`, each part a plain identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl TableName {
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Double-quoted form safe to splice into SQL.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl FromStr for TableName {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let invalid = || WarehouseError::InvalidTable(s.to_string());
        if !parts.iter().all(|p| is_identifier(p)) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [name] => Ok(Self {
                schema: None,
                name: name.to_string(),
            }),
            [schema, name] => Ok(Self {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("invalid table identifier {0:?}")]
    InvalidTable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected table layout: {0}")]
    Layout(String),
    #[error("warehouse task aborted: {0}")]
    Task(String),
}

/// Result of the distinct-key query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyQuery {
    Keys(Vec<String>),
    /// The table has never been written; a bootstrap condition, not an error.
    TableMissing,
}

/// One append-only bulk write.
#[derive(Debug, Clone, Copy)]
pub struct AppendJob<'a> {
    pub run_id: Uuid,
    pub loaded_at: DateTime<Utc>,
    pub records: &'a [ExpenseRecord],
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Human-readable target, used in logs and run summaries.
    fn target(&self) -> String;

    async fn distinct_keys(&self) -> Result<KeyQuery, WarehouseError>;

    /// Appends every record as one job and returns the acknowledged row count.
    /// Unseen payload fields must be accepted.
    async fn append(&self, job: &AppendJob<'_>) -> Result<u64, WarehouseError>;
}

#[derive(Debug, Clone, Default)]
pub struct IndexLoad {
    pub keys: ExistingKeySet,
    pub warning: Option<DegradedIndexWarning>,
}

/// Builds the run's dedup oracle from the target table.
pub struct ExistingKeyIndex {
    warehouse: Arc<dyn Warehouse>,
    timeout: Duration,
}

impl ExistingKeyIndex {
    pub fn new(warehouse: Arc<dyn Warehouse>, timeout: Duration) -> Self {
        Self { warehouse, timeout }
    }

    /// Never fails: any problem degrades to an empty key set plus a warning.
    pub async fn load(&self) -> IndexLoad {
        let target = self.warehouse.target();
        let degraded = |reason, detail: String| {
            warn!(%target, ?reason, %detail, "existing-key index degraded to empty set");
            IndexLoad {
                keys: ExistingKeySet::default(),
                warning: Some(DegradedIndexWarning { reason, detail }),
            }
        };

        match tokio::time::timeout(self.timeout, self.warehouse.distinct_keys()).await {
            Ok(Ok(KeyQuery::Keys(raw))) => {
                let keys = ExistingKeySet::from_raw_keys(raw);
                info!(%target, existing_keys = keys.len(), "loaded existing keys");
                IndexLoad {
                    keys,
                    warning: None,
                }
            }
            Ok(Ok(KeyQuery::TableMissing)) => degraded(
                IndexDegradeReason::TableMissing,
                format!("table {target} does not exist yet"),
            ),
            Ok(Err(err)) => degraded(IndexDegradeReason::QueryFailed, err.to_string()),
            Err(_) => degraded(
                IndexDegradeReason::TimedOut,
                format!("distinct-key query exceeded {:?}", self.timeout),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_appended: u64,
    pub write_issued: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("append to {target} failed: {source}")]
    Failed {
        target: String,
        #[source]
        source: WarehouseError,
    },
    #[error("append to {target} did not finish within {timeout:?}")]
    TimedOut { target: String, timeout: Duration },
    #[error("append to {target} acknowledged {acknowledged} rows for a batch of {expected}")]
    RowCountMismatch {
        target: String,
        expected: u64,
        acknowledged: u64,
    },
}

pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    timeout: Duration,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, timeout: Duration) -> Self {
        Self { warehouse, timeout }
    }

    /// Appends the whole batch as a single job. An empty batch issues no write.
    pub async fn append(&self, run_id: Uuid, batch: &NetNewBatch) -> Result<LoadOutcome, LoadError> {
        let target = self.warehouse.target();
        if batch.is_empty() {
            info!(%run_id, %target, "no net-new records; append skipped");
            return Ok(LoadOutcome {
                rows_appended: 0,
                write_issued: false,
            });
        }

        let job = AppendJob {
            run_id,
            loaded_at: Utc::now(),
            records: batch.records(),
        };
        info!(%run_id, %target, rows = batch.len(), "submitting append job");

        let acknowledged = match tokio::time::timeout(self.timeout, self.warehouse.append(&job)).await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(source)) => return Err(LoadError::Failed { target, source }),
            Err(_) => {
                return Err(LoadError::TimedOut {
                    target,
                    timeout: self.timeout,
                })
            }
        };

        let expected = batch.len() as u64;
        if acknowledged != expected {
            return Err(LoadError::RowCountMismatch {
                target,
                expected,
                acknowledged,
            });
        }

        info!(%run_id, %target, rows = acknowledged, "append job completed");
        Ok(LoadOutcome {
            rows_appended: acknowledged,
            write_issued: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use despesas_core::FiscalYear;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedWarehouse {
        keys: Option<Vec<String>>,
        fail_query: bool,
        fail_append: bool,
        stall: bool,
        appends: AtomicUsize,
    }

    #[async_trait]
    impl Warehouse for ScriptedWarehouse {
        fn target(&self) -> String {
            "scripted.table".into()
        }

        async fn distinct_keys(&self) -> Result<KeyQuery, WarehouseError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_query {
                return Err(WarehouseError::Layout("boom".into()));
            }
            Ok(match &self.keys {
                Some(keys) => KeyQuery::Keys(keys.clone()),
                None => KeyQuery::TableMissing,
            })
        }

        async fn append(&self, job: &AppendJob<'_>) -> Result<u64, WarehouseError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_append {
                return Err(WarehouseError::Layout("quota exceeded".into()));
            }
            Ok(job.records.len() as u64)
        }
    }

    fn batch_of(codes: &[&str]) -> NetNewBatch {
        let year = FiscalYear::new(2025).expect("year");
        NetNewBatch::new(
            codes
                .iter()
                .map(|code| {
                    let fields = json!({ "codigo_interno": code }).as_object().cloned().expect("obj");
                    ExpenseRecord::stamped(fields, year, "codigo_interno", "ano_api")
                })
                .collect(),
        )
    }

    #[test]
    fn table_names_are_validated() {
        let table: TableName = "despesas_queimados.raw_despesas_todas".parse().expect("valid");
        assert_eq!(table.schema(), Some("despesas_queimados"));
        assert_eq!(table.quoted(), "\"despesas_queimados\".\"raw_despesas_todas\"");
        assert_eq!("raw".parse::<TableName>().expect("valid").to_string(), "raw");
        assert!("raw; drop table x".parse::<TableName>().is_err());
        assert!("a.b.c".parse::<TableName>().is_err());
        assert!("1abc".parse::<TableName>().is_err());
    }

    #[tokio::test]
    async fn index_canonicalizes_loaded_keys() {
        let warehouse = Arc::new(ScriptedWarehouse {
            keys: Some(vec!["A1".into(), " 42 ".into()]),
            ..Default::default()
        });
        let load = ExistingKeyIndex::new(warehouse, Duration::from_secs(1)).load().await;
        assert!(load.warning.is_none());
        assert!(load.keys.contains("42"));
        assert_eq!(load.keys.len(), 2);
    }

    #[tokio::test]
    async fn missing_table_degrades_with_warning() {
        let warehouse = Arc::new(ScriptedWarehouse::default());
        let load = ExistingKeyIndex::new(warehouse, Duration::from_secs(1)).load().await;
        assert!(load.keys.is_empty());
        assert_eq!(
            load.warning.map(|w| w.reason),
            Some(IndexDegradeReason::TableMissing)
        );
    }

    #[tokio::test]
    async fn failed_or_slow_queries_degrade_with_warning() {
        let failing = Arc::new(ScriptedWarehouse {
            fail_query: true,
            ..Default::default()
        });
        let load = ExistingKeyIndex::new(failing, Duration::from_secs(1)).load().await;
        assert_eq!(
            load.warning.map(|w| w.reason),
            Some(IndexDegradeReason::QueryFailed)
        );

        let slow = Arc::new(ScriptedWarehouse {
            stall: true,
            keys: Some(vec![]),
            ..Default::default()
        });
        let load = ExistingKeyIndex::new(slow, Duration::from_millis(20)).load().await;
        assert_eq!(load.warning.map(|w| w.reason), Some(IndexDegradeReason::TimedOut));
    }

    #[tokio::test]
    async fn empty_batch_issues_no_write() {
        let warehouse = Arc::new(ScriptedWarehouse::default());
        let loader = WarehouseLoader::new(warehouse.clone(), Duration::from_secs(1));
        let outcome = loader
            .append(Uuid::new_v4(), &NetNewBatch::default())
            .await
            .expect("noop");
        assert_eq!(
            outcome,
            LoadOutcome {
                rows_appended: 0,
                write_issued: false
            }
        );
        assert_eq!(warehouse.appends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_empty_batch_is_one_append() {
        let warehouse = Arc::new(ScriptedWarehouse::default());
        let loader = WarehouseLoader::new(warehouse.clone(), Duration::from_secs(1));
        let outcome = loader
            .append(Uuid::new_v4(), &batch_of(&["A3", "A4"]))
            .await
            .expect("append");
        assert_eq!(outcome.rows_appended, 2);
        assert_eq!(warehouse.appends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn append_failures_surface_as_load_errors() {
        let failing = Arc::new(ScriptedWarehouse {
            fail_append: true,
            ..Default::default()
        });
        let err = WarehouseLoader::new(failing, Duration::from_secs(1))
            .append(Uuid::new_v4(), &batch_of(&["A3"]))
            .await
            .expect_err("fails");
        assert!(matches!(err, LoadError::Failed { .. }));

        let slow = Arc::new(ScriptedWarehouse {
            stall: true,
            ..Default::default()
        });
        let err = WarehouseLoader::new(slow, Duration::from_millis(20))
            .append(Uuid::new_v4(), &batch_of(&["A3"]))
            .await
            .expect_err("times out");
        assert!(matches!(err, LoadError::TimedOut { .. }));
    }
}
