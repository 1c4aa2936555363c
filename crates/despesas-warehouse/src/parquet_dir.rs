//! Local table backend: one directory per table, one Parquet part file per append.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{ArrayRef, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use despesas_core::ExpenseRecord;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::{AppendJob, KeyQuery, TableName, Warehouse, WarehouseError, METADATA_COLUMNS};

#[derive(Debug, Clone)]
pub struct ParquetTableWarehouse {
    root: PathBuf,
    table: TableName,
}

impl ParquetTableWarehouse {
    pub fn new(root: impl Into<PathBuf>, table: TableName) -> Self {
        Self {
            root: root.into(),
            table,
        }
    }

    pub fn table_dir(&self) -> PathBuf {
        self.root.join(self.table.to_string())
    }

    /// Committed part files, oldest name first.
    pub fn part_files(&self) -> Result<Vec<PathBuf>, WarehouseError> {
        list_parts(&self.table_dir())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WarehouseError + '_ {
    move |source| WarehouseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn list_parts(dir: &Path) -> Result<Vec<PathBuf>, WarehouseError> {
    let mut parts = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        let committed = path.extension().is_some_and(|ext| ext == "parquet")
            && !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
        if committed {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}

fn read_keys(dir: &Path) -> Result<KeyQuery, WarehouseError> {
    if !dir.is_dir() {
        return Ok(KeyQuery::TableMissing);
    }

    let mut keys = Vec::new();
    for path in list_parts(dir)? {
        let file = File::open(&path).map_err(io_error(&path))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            let batch = batch?;
            let column = batch.column_by_name("internal_code").ok_or_else(|| {
                WarehouseError::Layout(format!("{} has no internal_code column", path.display()))
            })?;
            let codes = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    WarehouseError::Layout(format!(
                        "{} stores internal_code as {}",
                        path.display(),
                        column.data_type()
                    ))
                })?;
            keys.extend(codes.iter().flatten().map(str::to_string));
        }
    }
    Ok(KeyQuery::Keys(keys))
}

/// Payload field names in first-seen order, paired with their column names.
fn payload_columns(records: &[ExpenseRecord]) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut taken: HashSet<String> = METADATA_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut columns = Vec::new();
    for record in records {
        for field in record.fields.keys() {
            if !seen.insert(field.clone()) {
                continue;
            }
            let mut column = field.clone();
            while taken.contains(&column) {
                column = format!("payload_{column}");
            }
            taken.insert(column.clone());
            columns.push((field.clone(), column));
        }
    }
    columns
}

fn cell(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn build_batch(job: &AppendJob<'_>) -> Result<RecordBatch, WarehouseError> {
    let records = job.records;
    let payload = payload_columns(records);

    let mut fields = vec![
        Field::new("internal_code", DataType::Utf8, true),
        Field::new("fiscal_year", DataType::Int32, false),
        Field::new("run_id", DataType::Utf8, false),
        Field::new("loaded_at", DataType::Utf8, false),
    ];
    fields.extend(
        payload
            .iter()
            .map(|(_, column)| Field::new(column.as_str(), DataType::Utf8, true)),
    );

    let run_id = job.run_id.to_string();
    let loaded_at = job.loaded_at.to_rfc3339();
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.internal_code.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            records.iter().map(|r| r.fiscal_year.get()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(vec![run_id.as_str(); records.len()])),
        Arc::new(StringArray::from(vec![loaded_at.as_str(); records.len()])),
    ];
    for (field, _) in &payload {
        columns.push(Arc::new(
            records
                .iter()
                .map(|r| cell(r.fields.get(field)))
                .collect::<StringArray>(),
        ));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn write_part(dir: &Path, file_name: &str, batch: RecordBatch) -> Result<u64, WarehouseError> {
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    let final_path = dir.join(file_name);
    let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = (|| -> Result<(), WarehouseError> {
        let file = File::create(&temp_path).map_err(io_error(&temp_path))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        std::fs::rename(&temp_path, &final_path).map_err(io_error(&final_path))
    })();

    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }
    debug!(path = %final_path.display(), rows = batch.num_rows(), "committed parquet part");
    Ok(batch.num_rows() as u64)
}

#[async_trait]
impl Warehouse for ParquetTableWarehouse {
    fn target(&self) -> String {
        format!("parquet:{}", self.table_dir().display())
    }

    async fn distinct_keys(&self) -> Result<KeyQuery, WarehouseError> {
        let dir = self.table_dir();
        tokio::task::spawn_blocking(move || read_keys(&dir))
            .await
            .map_err(|err| WarehouseError::Task(err.to_string()))?
    }

    async fn append(&self, job: &AppendJob<'_>) -> Result<u64, WarehouseError> {
        if job.records.is_empty() {
            return Ok(0);
        }
        let batch = build_batch(job)?;
        let dir = self.table_dir();
        let file_name = format!(
            "part-{}-{}.parquet",
            job.loaded_at.format("%Y%m%dT%H%M%S"),
            job.run_id
        );
        tokio::task::spawn_blocking(move || write_part(&dir, &file_name, batch))
            .await
            .map_err(|err| WarehouseError::Task(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use despesas_core::FiscalYear;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(year: i32, fields: Value) -> ExpenseRecord {
        ExpenseRecord::stamped(
            fields.as_object().cloned().expect("object"),
            FiscalYear::new(year).expect("year"),
            "codigo_interno",
            "ano_api",
        )
    }

    fn warehouse(root: &Path) -> ParquetTableWarehouse {
        ParquetTableWarehouse::new(root, "despesas.raw".parse().expect("table"))
    }

    fn job(records: &[ExpenseRecord]) -> AppendJob<'_> {
        AppendJob {
            run_id: Uuid::new_v4(),
            loaded_at: Utc::now(),
            records,
        }
    }

    fn column_names(path: &Path) -> Vec<String> {
        let file = File::open(path).expect("open part");
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).expect("reader");
        builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    #[tokio::test]
    async fn absent_table_directory_reports_missing() {
        let dir = tempdir().expect("tempdir");
        let result = warehouse(dir.path()).distinct_keys().await.expect("query");
        assert_eq!(result, KeyQuery::TableMissing);
    }

    #[tokio::test]
    async fn appended_codes_are_visible_to_key_query() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse(dir.path());
        let records = vec![
            record(2025, json!({"codigo_interno": 42, "valor": 10.5})),
            record(2025, json!({"historico": "sem codigo"})),
        ];

        let rows = wh.append(&job(&records)).await.expect("append");
        assert_eq!(rows, 2);

        let KeyQuery::Keys(keys) = wh.distinct_keys().await.expect("query") else {
            panic!("table should exist");
        };
        assert_eq!(keys, vec!["42".to_string()]);
    }

    #[tokio::test]
    async fn each_append_is_one_part_with_its_own_schema() {
        let dir = tempdir().expect("tempdir");
        let wh = warehouse(dir.path());

        let first = vec![record(2025, json!({"codigo_interno": "A1", "valor": "1"}))];
        let second = vec![record(
            2026,
            json!({"codigo_interno": "A2", "valor": "2", "credor": "ACME"}),
        )];
        wh.append(&job(&first)).await.expect("first");
        wh.append(&job(&second)).await.expect("second");

        let parts = wh.part_files().expect("parts");
        assert_eq!(parts.len(), 2);
        let mut schemas: Vec<Vec<String>> = parts.iter().map(|p| column_names(p)).collect();
        schemas.sort_by_key(|s| s.len());
        assert!(!schemas[0].contains(&"credor".to_string()));
        assert!(schemas[1].contains(&"credor".to_string()));

        let KeyQuery::Keys(mut keys) = wh.distinct_keys().await.expect("query") else {
            panic!("table should exist");
        };
        keys.sort();
        assert_eq!(keys, vec!["A1".to_string(), "A2".to_string()]);
    }

    #[test]
    fn payload_fields_colliding_with_metadata_are_prefixed() {
        let records = vec![record(
            2025,
            json!({"codigo_interno": "A1", "run_id": "upstream", "valor": "3"}),
        )];
        let columns = payload_columns(&records);
        assert_eq!(
            columns,
            vec![
                ("codigo_interno".to_string(), "codigo_interno".to_string()),
                ("run_id".to_string(), "payload_run_id".to_string()),
                ("valor".to_string(), "valor".to_string()),
                ("ano_api".to_string(), "ano_api".to_string()),
            ]
        );
    }

    #[test]
    fn cells_render_scalars_as_text() {
        assert_eq!(cell(Some(&json!("x"))), Some("x".to_string()));
        assert_eq!(cell(Some(&json!(1.5))), Some("1.5".to_string()));
        assert_eq!(cell(Some(&json!(null))), None);
        assert_eq!(cell(None), None);
    }
}
