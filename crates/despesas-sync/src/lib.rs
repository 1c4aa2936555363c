//! Run orchestration: existing-key index, concurrent per-year fetches, dedup, one append.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use despesas_core::{
    ExistingKeySet, FiscalYear, IngestionRunResult, NetNewBatch, RunStatus, YearFailureKind,
};
use despesas_source::{ApiYearSource, SourceError, YearSource};
use despesas_storage::{HttpClientConfig, HttpFetcher, ResponseArchive, RetryPolicy};
use despesas_warehouse::{
    ExistingKeyIndex, LoadError, ParquetTableWarehouse, PostgresWarehouse, Warehouse,
    WarehouseLoader,
};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
pub mod dedup;
mod report;

pub use config::{resolve_database_url, IngestConfig, WarehouseKind, DEFAULT_CONFIG_FILE};
pub use dedup::{DedupResolver, MissingIdPolicy, PrefilteredBatch, Resolution};
pub use report::{recent_runs_markdown, render_brief, ReportWriter, BRIEF_FILE, SUMMARY_FILE};

pub const CRATE_NAME: &str = "despesas-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0:#}")]
    Config(#[from] anyhow::Error),
    /// The append failed. The computed batch is handed back so the caller decides what to do.
    #[error("run {} failed to load: {source}", .result.run_id)]
    Load {
        result: Box<IngestionRunResult>,
        net_new: NetNewBatch,
        #[source]
        source: LoadError,
    },
    #[error("run {} cancelled before the append", .result.run_id)]
    Cancelled { result: Box<IngestionRunResult> },
}

impl PipelineError {
    pub fn result(&self) -> Option<&IngestionRunResult> {
        match self {
            Self::Config(_) => None,
            Self::Load { result, .. } | Self::Cancelled { result } => Some(result),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Validated and de-duplicated; this order decides cross-year attribution.
    pub years: Vec<FiscalYear>,
    pub max_concurrent_fetches: usize,
    pub warehouse_timeout: Duration,
}

type FetchOutcome = (usize, FiscalYear, Result<PrefilteredBatch, SourceError>);

pub struct IngestPipeline {
    source: Arc<dyn YearSource>,
    warehouse: Arc<dyn Warehouse>,
    resolver: DedupResolver,
    settings: RunSettings,
    reports: Option<ReportWriter>,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn YearSource>,
        warehouse: Arc<dyn Warehouse>,
        resolver: DedupResolver,
        settings: RunSettings,
    ) -> Self {
        Self {
            source,
            warehouse,
            resolver,
            settings,
            reports: None,
        }
    }

    pub fn with_reports(mut self, reports: ReportWriter) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn warehouse(&self) -> Arc<dyn Warehouse> {
        self.warehouse.clone()
    }

    pub async fn run_once(&self) -> Result<IngestionRunResult, PipelineError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Runs to completion unless `shutdown` resolves during the fetch phase. Once the
    /// append is submitted, `shutdown` is no longer observed.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<IngestionRunResult, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = %self.source.label());
        self.execute(run_id, shutdown).instrument(span).await
    }

    async fn execute<F>(&self, run_id: Uuid, shutdown: F) -> Result<IngestionRunResult, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let years = &self.settings.years;
        let mut result = IngestionRunResult::start(run_id, self.warehouse.target(), years);
        info!(years = ?years.iter().map(|y| y.get()).collect::<Vec<_>>(), "run started");

        let index = ExistingKeyIndex::new(self.warehouse.clone(), self.settings.warehouse_timeout)
            .load()
            .await;
        result.existing_keys = index.keys.len();
        result.index_warning = index.warning;
        let existing = Arc::new(index.keys);

        let Some(batches) = self.fetch_all(run_id, &existing, &mut result, shutdown).await else {
            result.finish_cancelled();
            warn!(failed_years = result.failed_years(), "run cancelled; nothing appended");
            self.write_report(&result).await;
            return Err(PipelineError::Cancelled {
                result: Box::new(result),
            });
        };

        let resolution = self.resolver.merge(batches);
        for (year, counts) in resolution.counts {
            if let Some(report) = result.year_mut(year) {
                report.counts = counts;
            }
        }
        for report in &result.years {
            if report.failure.is_none() {
                let c = &report.counts;
                info!(
                    year = %report.year,
                    fetched = c.fetched,
                    rejected_existing = c.rejected_existing,
                    rejected_intra_run = c.rejected_intra_run,
                    skipped_no_id = c.skipped_no_id,
                    net_new = c.net_new,
                    "year resolved"
                );
            }
        }

        let net_new = resolution.net_new;
        let loader = WarehouseLoader::new(self.warehouse.clone(), self.settings.warehouse_timeout);
        match loader.append(run_id, &net_new).await {
            Ok(outcome) => result.finish_loaded(outcome.rows_appended),
            Err(source) => {
                error!(error = %source, net_new = net_new.len(), "load failed; run is fatal");
                result.finish_failed(source.to_string());
                self.write_report(&result).await;
                return Err(PipelineError::Load {
                    result: Box::new(result),
                    net_new,
                    source,
                });
            }
        }

        if result.status == RunStatus::Partial {
            warn!(
                failed_years = result.failed_years(),
                rows_appended = result.rows_appended,
                "run finished with failed years"
            );
        } else {
            info!(rows_appended = result.rows_appended, "run succeeded");
        }
        self.write_report(&result).await;
        Ok(result)
    }

    /// Fetches every year with bounded concurrency and prefilters each batch as it lands.
    /// Returns batches in configured year order, or `None` when cancelled.
    async fn fetch_all<F>(
        &self,
        run_id: Uuid,
        existing: &Arc<ExistingKeySet>,
        result: &mut IngestionRunResult,
        shutdown: F,
    ) -> Option<Vec<PrefilteredBatch>>
    where
        F: Future<Output = ()>,
    {
        let years = &self.settings.years;
        let limit = Arc::new(Semaphore::new(self.settings.max_concurrent_fetches.max(1)));
        let mut tasks: JoinSet<FetchOutcome> = JoinSet::new();

        for (slot, &year) in years.iter().enumerate() {
            let source = self.source.clone();
            let existing = existing.clone();
            let limit = limit.clone();
            let resolver = self.resolver;
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    let fetched = source.fetch(run_id, year).await;
                    (slot, year, fetched.map(|batch| resolver.prefilter(batch, &existing)))
                }
                .in_current_span(),
            );
        }

        let mut slots: Vec<Option<PrefilteredBatch>> = years.iter().map(|_| None).collect();
        let mut aborted: Vec<String> = Vec::new();
        tokio::pin!(shutdown);

        while !tasks.is_empty() {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((slot, _, Ok(batch)))) => slots[slot] = Some(batch),
                    Some(Ok((_, year, Err(err)))) => {
                        warn!(%year, kind = ?err.kind(), error = %err, "year failed");
                        result.record_failure(year, err.kind(), err.to_string());
                    }
                    Some(Err(join_err)) => {
                        error!(error = %join_err, "fetch task aborted");
                        aborted.push(join_err.to_string());
                    }
                    None => break,
                },
                _ = &mut shutdown => {
                    tasks.abort_all();
                    for (slot, &year) in years.iter().enumerate() {
                        if let Some(batch) = &slots[slot] {
                            // Fetched before the cancel: keep its first-pass counts.
                            if let Some(report) = result.year_mut(year) {
                                report.counts = batch.counts.clone();
                            }
                        } else if result.year_mut(year).is_some_and(|r| r.failure.is_none()) {
                            result.record_failure(
                                year,
                                YearFailureKind::Cancelled,
                                "run cancelled before fetch completed".to_string(),
                            );
                        }
                    }
                    return None;
                }
            }
        }

        // A panicked task loses its year; attribute the failure to whichever years are unresolved.
        if !aborted.is_empty() {
            let detail = aborted.join("; ");
            for (slot, &year) in years.iter().enumerate() {
                let unresolved = slots[slot].is_none()
                    && result.year_mut(year).is_some_and(|r| r.failure.is_none());
                if unresolved {
                    result.record_failure(
                        year,
                        YearFailureKind::Transport,
                        format!("fetch task aborted: {detail}"),
                    );
                }
            }
        }

        Some(slots.into_iter().flatten().collect())
    }

    async fn write_report(&self, result: &IngestionRunResult) {
        let Some(reports) = &self.reports else {
            return;
        };
        match reports.write(result).await {
            Ok(dir) => info!(path = %dir.display(), "wrote run report"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to write run report"),
        }
    }
}

/// Wires the production source and the configured warehouse backend.
pub fn build_pipeline(config: &IngestConfig) -> Result<IngestPipeline, PipelineError> {
    let years = config.fiscal_years()?;
    let table = config.table_name()?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        max_concurrency: config.max_concurrent_fetches.max(1),
        retry: RetryPolicy {
            max_retries: config.max_retries,
            ..RetryPolicy::default()
        },
    })?;
    let mut source = ApiYearSource::new(
        config.endpoint.clone(),
        config.record_shape(),
        Arc::new(http),
    );
    if let Some(dir) = &config.raw_archive_dir {
        source = source.with_archive(ResponseArchive::new(dir.clone()));
    }

    let warehouse: Arc<dyn Warehouse> = match config.warehouse {
        WarehouseKind::Postgres => {
            let url = resolve_database_url(|key| std::env::var(key).ok())?;
            Arc::new(
                PostgresWarehouse::connect_lazy(&url, table, config.warehouse_timeout())
                    .context("configuring postgres pool")?,
            )
        }
        WarehouseKind::Parquet => {
            Arc::new(ParquetTableWarehouse::new(config.parquet_root.clone(), table))
        }
    };

    let pipeline = IngestPipeline::new(
        Arc::new(source),
        warehouse,
        DedupResolver::new(config.missing_id_policy()),
        RunSettings {
            years,
            max_concurrent_fetches: config.max_concurrent_fetches,
            warehouse_timeout: config.warehouse_timeout(),
        },
    );
    Ok(match &config.reports_dir {
        Some(dir) => pipeline.with_reports(ReportWriter::new(dir.clone())),
        None => pipeline,
    })
}

/// Resolves when the process receives Ctrl-C. Never resolves if the handler cannot be installed.
pub async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c; cancellation disabled");
        std::future::pending::<()>().await;
    }
}

/// Runs the pipeline unless a previous run still holds `lock`; `None` means the tick was skipped.
pub async fn run_guarded(
    pipeline: &IngestPipeline,
    lock: &Arc<Mutex<()>>,
) -> Option<Result<IngestionRunResult, PipelineError>> {
    let Ok(_guard) = lock.clone().try_lock_owned() else {
        warn!("previous run still in progress; skipping scheduled tick");
        return None;
    };
    Some(pipeline.run_once().await)
}

pub async fn build_scheduler(
    pipeline: Arc<IngestPipeline>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let lock = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let lock = lock.clone();
        Box::pin(async move {
            match run_guarded(&pipeline, &lock).await {
                Some(Ok(result)) => info!(
                    run_id = %result.run_id,
                    status = ?result.status,
                    rows_appended = result.rows_appended,
                    "scheduled run finished"
                ),
                Some(Err(err)) => error!(error = %err, "scheduled run failed"),
                None => {}
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use despesas_core::{ExpenseRecord, FetchBatch};
    use despesas_warehouse::{AppendJob, KeyQuery, WarehouseError};
    use serde_json::json;

    struct SlowSource;

    #[async_trait]
    impl YearSource for SlowSource {
        fn label(&self) -> String {
            "slow".into()
        }

        async fn fetch(&self, _run_id: Uuid, year: FiscalYear) -> Result<FetchBatch, SourceError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let fields = json!({"codigo_interno": "A1"}).as_object().cloned().expect("obj");
            Ok(FetchBatch {
                year,
                records: vec![ExpenseRecord::stamped(fields, year, "codigo_interno", "ano_api")],
            })
        }
    }

    struct EmptyWarehouse;

    #[async_trait]
    impl Warehouse for EmptyWarehouse {
        fn target(&self) -> String {
            "memory".into()
        }

        async fn distinct_keys(&self) -> Result<KeyQuery, WarehouseError> {
            Ok(KeyQuery::Keys(vec![]))
        }

        async fn append(&self, job: &AppendJob<'_>) -> Result<u64, WarehouseError> {
            Ok(job.records.len() as u64)
        }
    }

    fn pipeline() -> IngestPipeline {
        IngestPipeline::new(
            Arc::new(SlowSource),
            Arc::new(EmptyWarehouse),
            DedupResolver::default(),
            RunSettings {
                years: vec![FiscalYear::new(2025).expect("year")],
                max_concurrent_fetches: 1,
                warehouse_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn run_lock_skips_overlapping_ticks() {
        let pipeline = pipeline();
        let lock = Arc::new(Mutex::new(()));

        let held = lock.clone().lock_owned().await;
        assert!(run_guarded(&pipeline, &lock).await.is_none());
        drop(held);

        let result = run_guarded(&pipeline, &lock)
            .await
            .expect("lock free")
            .expect("run ok");
        assert_eq!(result.rows_appended, 1);
    }

    #[test]
    fn config_errors_carry_no_result() {
        let err = PipelineError::from(anyhow::anyhow!("no years"));
        assert!(err.result().is_none());
        assert!(err.to_string().contains("no years"));
    }
}
