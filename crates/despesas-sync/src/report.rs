//! Per-run summary files under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use despesas_core::{IngestionRunResult, RunStatus};
use tokio::fs;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Writes `run_summary.json` and `run_brief.md`, returning the run directory.
    pub async fn write(&self, result: &IngestionRunResult) -> Result<PathBuf> {
        let dir = self.root.join(result.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let summary = serde_json::to_vec_pretty(result).context("serializing run summary")?;
        fs::write(dir.join(SUMMARY_FILE), summary)
            .await
            .with_context(|| format!("writing {SUMMARY_FILE}"))?;
        fs::write(dir.join(BRIEF_FILE), render_brief(result))
            .await
            .with_context(|| format!("writing {BRIEF_FILE}"))?;
        Ok(dir)
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

pub fn render_brief(result: &IngestionRunResult) -> String {
    let mut lines = vec![
        "# Expense Ingestion Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", result.run_id),
        format!("- Table: `{}`", result.table),
        format!("- Status: {}", status_label(result.status)),
        format!("- Started: {}", result.started_at),
    ];
    if let Some(finished_at) = result.finished_at {
        lines.push(format!("- Finished: {finished_at}"));
    }
    lines.push(format!("- Existing keys: {}", result.existing_keys));
    lines.push(format!("- Rows appended: {}", result.rows_appended));
    if let Some(warning) = &result.index_warning {
        lines.push(format!(
            "- Index degraded ({:?}): {}",
            warning.reason, warning.detail
        ));
    }
    if let Some(cause) = &result.load_error {
        lines.push(format!("- Load error: {cause}"));
    }

    lines.push(String::new());
    lines.push("## Years".to_string());
    lines.push(String::new());
    lines.push("| year | fetched | existing | intra-run | no id | net new | failure |".to_string());
    lines.push("|---|---|---|---|---|---|---|".to_string());
    for report in &result.years {
        let c = &report.counts;
        let failure = report
            .failure
            .as_ref()
            .map(|f| format!("{:?}: {}", f.kind, f.message))
            .unwrap_or_default();
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            report.year,
            c.fetched,
            c.rejected_existing,
            c.rejected_intra_run,
            c.skipped_no_id + c.passed_without_id,
            c.net_new,
            failure
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the `runs` most recent run summaries under `root`, newest first.
pub fn recent_runs_markdown(root: &Path, runs: usize) -> Result<String> {
    let mut results = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let path = entry?.path().join(SUMMARY_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let result: IngestionRunResult = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        results.push(result);
    }
    results.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Recent Ingestion Runs".to_string(), String::new()];
    if results.is_empty() {
        lines.push(format!("No runs recorded under `{}`.", root.display()));
    }
    for result in results.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", result.run_id));
        lines.push(format!("- started: {}", result.started_at));
        lines.push(format!("- status: {}", status_label(result.status)));
        lines.push(format!(
            "- fetched: {}",
            result.total(|c| c.fetched)
        ));
        lines.push(format!("- appended: {}", result.rows_appended));
        let failed: Vec<String> = result
            .failures()
            .map(|(year, f)| format!("{year} ({:?})", f.kind))
            .collect();
        if !failed.is_empty() {
            lines.push(format!("- failed years: {}", failed.join(", ")));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use despesas_core::{FiscalYear, YearFailureKind};
    use uuid::Uuid;

    fn result(status_fail: bool, minutes_ago: i64) -> IngestionRunResult {
        let years = [
            FiscalYear::new(2025).expect("year"),
            FiscalYear::new(2026).expect("year"),
        ];
        let mut result = IngestionRunResult::start(Uuid::new_v4(), "despesas.raw", &years);
        result.started_at = Utc::now() - Duration::minutes(minutes_ago);
        if let Some(report) = result.year_mut(years[0]) {
            report.counts.fetched = 3;
            report.counts.net_new = 2;
        }
        if status_fail {
            result.record_failure(years[1], YearFailureKind::Transport, "HTTP 503".into());
        }
        result.finish_loaded(2);
        result
    }

    #[tokio::test]
    async fn writer_emits_summary_and_brief() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());
        let run = result(true, 0);

        let run_dir = writer.write(&run).await.expect("write");
        let summary: IngestionRunResult = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).expect("summary"),
        )
        .expect("parse");
        assert_eq!(summary, run);

        let brief = std::fs::read_to_string(run_dir.join(BRIEF_FILE)).expect("brief");
        assert!(brief.contains("- Status: partial"));
        assert!(brief.contains("| 2025 | 3 | 0 | 0 | 0 | 2 |  |"));
        assert!(brief.contains("Transport: HTTP 503"));
    }

    #[tokio::test]
    async fn recent_runs_lists_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());
        let older = result(false, 60);
        let newer = result(true, 1);
        writer.write(&older).await.expect("older");
        writer.write(&newer).await.expect("newer");

        let markdown = recent_runs_markdown(dir.path(), 5).expect("markdown");
        let newer_at = markdown.find(&newer.run_id.to_string()).expect("newer listed");
        let older_at = markdown.find(&older.run_id.to_string()).expect("older listed");
        assert!(newer_at < older_at);
        assert!(markdown.contains("- failed years: 2026 (Transport)"));

        let only_one = recent_runs_markdown(dir.path(), 1).expect("markdown");
        assert!(!only_one.contains(&older.run_id.to_string()));
    }
}
