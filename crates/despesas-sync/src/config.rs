//! Run configuration: `ingest.yaml` (optional) overlaid with `DESPESAS_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use despesas_core::{dedup_years, FiscalYear};
use despesas_source::{EndpointConfig, RecordShape};
use despesas_warehouse::TableName;
use serde::{Deserialize, Serialize};

use crate::dedup::MissingIdPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "ingest.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseKind {
    #[default]
    Postgres,
    Parquet,
}

impl std::str::FromStr for WarehouseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "parquet" => Ok(Self::Parquet),
            other => bail!("unknown warehouse {other:?} (expected postgres or parquet)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub years: Vec<i32>,
    pub endpoint: EndpointConfig,
    pub id_field: String,
    pub year_stamp_field: String,
    pub table: String,
    pub warehouse: WarehouseKind,
    pub parquet_root: PathBuf,
    pub strict_ids: bool,
    pub http_timeout_secs: u64,
    pub warehouse_timeout_secs: u64,
    pub max_concurrent_fetches: usize,
    pub max_retries: usize,
    pub user_agent: String,
    pub raw_archive_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub schedule_cron: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let shape = RecordShape::default();
        Self {
            years: vec![2025, 2026],
            endpoint: EndpointConfig::default(),
            id_field: shape.id_field,
            year_stamp_field: shape.year_stamp_field,
            table: "despesas_queimados.raw_despesas_todas".to_string(),
            warehouse: WarehouseKind::Postgres,
            parquet_root: PathBuf::from("./warehouse"),
            strict_ids: false,
            http_timeout_secs: 20,
            warehouse_timeout_secs: 120,
            max_concurrent_fetches: 2,
            max_retries: 3,
            user_agent: "despesas-ingest/0.1".to_string(),
            raw_archive_dir: None,
            reports_dir: None,
            schedule_cron: "0 0 6 * * *".to_string(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("parsing {key}={value:?}"))
}

impl IngestConfig {
    /// Reads `path` (must exist) or, when `None`, `ingest.yaml` under `workspace_root`
    /// if present, then applies the process environment.
    pub fn load(path: Option<&Path>, workspace_root: &Path) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => {
                let default_path = workspace_root.join(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_yaml_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("DESPESAS_YEARS") {
            self.years = v
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| parse_number("DESPESAS_YEARS", part))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = lookup("DESPESAS_API_URL") {
            self.endpoint.url = v;
        }
        if let Some(v) = lookup("DESPESAS_TRANSPORT") {
            self.endpoint.transport = v
                .parse()
                .map_err(anyhow::Error::msg)
                .context("parsing DESPESAS_TRANSPORT")?;
        }
        if let Some(v) = lookup("DESPESAS_TABLE") {
            self.table = v;
        }
        if let Some(v) = lookup("DESPESAS_WAREHOUSE") {
            self.warehouse = v.parse().context("parsing DESPESAS_WAREHOUSE")?;
        }
        if let Some(v) = lookup("DESPESAS_PARQUET_ROOT") {
            self.parquet_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DESPESAS_STRICT_IDS") {
            self.strict_ids = parse_bool(&v);
        }
        if let Some(v) = lookup("DESPESAS_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number("DESPESAS_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DESPESAS_WAREHOUSE_TIMEOUT_SECS") {
            self.warehouse_timeout_secs = parse_number("DESPESAS_WAREHOUSE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DESPESAS_MAX_CONCURRENT_FETCHES") {
            self.max_concurrent_fetches = parse_number("DESPESAS_MAX_CONCURRENT_FETCHES", &v)?;
        }
        if let Some(v) = lookup("DESPESAS_RAW_ARCHIVE_DIR") {
            self.raw_archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DESPESAS_REPORTS_DIR") {
            self.reports_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DESPESAS_SYNC_CRON") {
            self.schedule_cron = v;
        }
        if let Some(v) = lookup("DESPESAS_USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }

    /// Validated, de-duplicated years in configured order.
    pub fn fiscal_years(&self) -> Result<Vec<FiscalYear>> {
        let years = self
            .years
            .iter()
            .map(|&y| FiscalYear::new(y))
            .collect::<Result<Vec<_>, _>>()
            .context("validating configured years")?;
        let years = dedup_years(years);
        if years.is_empty() {
            bail!("no fiscal years configured");
        }
        Ok(years)
    }

    pub fn table_name(&self) -> Result<TableName> {
        self.table
            .parse()
            .with_context(|| format!("validating table {:?}", self.table))
    }

    pub fn record_shape(&self) -> RecordShape {
        RecordShape {
            id_field: self.id_field.clone(),
            year_stamp_field: self.year_stamp_field.clone(),
        }
    }

    pub fn missing_id_policy(&self) -> MissingIdPolicy {
        if self.strict_ids {
            MissingIdPolicy::Strict
        } else {
            MissingIdPolicy::Lenient
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn warehouse_timeout(&self) -> Duration {
        Duration::from_secs(self.warehouse_timeout_secs.max(1))
    }
}

/// Resolves the warehouse connection string: `DESPESAS_DATABASE_URL`, then the file named by
/// `DESPESAS_DATABASE_URL_FILE`. Fails before any network call when neither is usable.
pub fn resolve_database_url(lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    if let Some(url) = lookup("DESPESAS_DATABASE_URL").filter(|u| !u.trim().is_empty()) {
        return Ok(url.trim().to_string());
    }
    if let Some(path) = lookup("DESPESAS_DATABASE_URL_FILE") {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading database url from {path}"))?;
        let url = text.trim();
        if url.is_empty() {
            bail!("{path} is empty");
        }
        return Ok(url.to_string());
    }
    bail!("no warehouse credentials: set DESPESAS_DATABASE_URL or DESPESAS_DATABASE_URL_FILE")
}
