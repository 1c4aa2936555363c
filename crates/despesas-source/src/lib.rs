//! Fetches one fiscal year of expense records from the transparency API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use despesas_core::{ExpenseRecord, FetchBatch, FiscalYear, YearFailureKind};
use despesas_storage::{
    FetchError, HttpFetcher, HttpRequest, RequestShape, ResponseArchive, ResponseKey,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "despesas-source";

pub const DEFAULT_ENDPOINT: &str =
    "https://transparencia.queimados.rj.gov.br/sincronia/apidados.rule";

/// Status values meaning "served". `sucess` is an upstream misspelling still in use.
pub const ACCEPTED_STATUSES: [&str; 2] = ["success", "sucess"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Get,
    #[default]
    Post,
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            other => Err(format!("unknown transport {other:?} (expected get or post)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    pub system: String,
    pub api_name: String,
    pub transport: Transport,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            system: "LAI".to_string(),
            api_name: "despesas_todas".to_string(),
            transport: Transport::Post,
        }
    }
}

impl EndpointConfig {
    pub fn request_for(&self, year: FiscalYear) -> HttpRequest {
        let sys = ("sys".to_string(), self.system.clone());
        let shape = match self.transport {
            Transport::Get => RequestShape::Get {
                query: vec![
                    sys,
                    ("api".to_string(), self.api_name.clone()),
                    ("ano".to_string(), year.to_string()),
                ],
            },
            Transport::Post => RequestShape::PostJson {
                query: vec![sys],
                body: json!({ "api": self.api_name, "ano": year.get() }),
            },
        };
        HttpRequest {
            url: self.url.clone(),
            shape,
        }
    }
}

/// Field names the fetcher reads the dedup key from and stamps the year into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordShape {
    pub id_field: String,
    pub year_stamp_field: String,
}

impl Default for RecordShape {
    fn default() -> Self {
        Self {
            id_field: "codigo_interno".to_string(),
            year_stamp_field: "ano_api".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport failure for {year}: {source}")]
    Transport {
        year: FiscalYear,
        #[source]
        source: FetchError,
    },
    #[error("api could not serve {year} (status {status:?}): {detail}")]
    ApiLogical {
        year: FiscalYear,
        status: String,
        detail: String,
    },
    #[error("malformed payload for {year}: {reason}")]
    Payload { year: FiscalYear, reason: String },
}

impl SourceError {
    pub fn year(&self) -> FiscalYear {
        match self {
            Self::Transport { year, .. }
            | Self::ApiLogical { year, .. }
            | Self::Payload { year, .. } => *year,
        }
    }

    pub fn kind(&self) -> YearFailureKind {
        match self {
            Self::Transport { .. } => YearFailureKind::Transport,
            Self::ApiLogical { .. } => YearFailureKind::ApiLogical,
            Self::Payload { .. } => YearFailureKind::Payload,
        }
    }
}

/// Anything that can produce one year's batch. The HTTP API is the production implementation.
#[async_trait]
pub trait YearSource: Send + Sync {
    fn label(&self) -> String;

    async fn fetch(&self, run_id: Uuid, year: FiscalYear) -> Result<FetchBatch, SourceError>;
}

pub fn is_accepted_status(status: &str) -> bool {
    let status = status.trim();
    ACCEPTED_STATUSES
        .iter()
        .any(|accepted| status.eq_ignore_ascii_case(accepted))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interprets one response body.
///
/// Accepts either an object (optional `status`, records under `dados`) or a bare
/// array of records. An object without `dados` yields an empty batch.
pub fn parse_payload(
    body: &[u8],
    year: FiscalYear,
    shape: &RecordShape,
) -> Result<FetchBatch, SourceError> {
    let payload: Value = serde_json::from_slice(body).map_err(|err| SourceError::Payload {
        year,
        reason: format!("invalid json: {err}"),
    })?;

    let rows = match payload {
        Value::Object(mut envelope) => {
            if let Some(status) = envelope.get("status") {
                let accepted = matches!(status, Value::String(s) if is_accepted_status(s));
                if !accepted {
                    return Err(SourceError::ApiLogical {
                        year,
                        status: render(status),
                        detail: envelope
                            .get("retorno")
                            .map(render)
                            .unwrap_or_default(),
                    });
                }
            }
            match envelope.remove("dados") {
                Some(Value::Array(rows)) => rows,
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(SourceError::Payload {
                        year,
                        reason: format!("`dados` is not a list but {}", json_kind(&other)),
                    })
                }
            }
        }
        Value::Array(rows) => rows,
        other => {
            return Err(SourceError::Payload {
                year,
                reason: format!("unexpected top-level {}", json_kind(&other)),
            })
        }
    };

    let mut records = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let fields = match row {
            Value::Object(fields) => fields,
            other => {
                return Err(SourceError::Payload {
                    year,
                    reason: format!("record {index} is {}, not an object", json_kind(&other)),
                })
            }
        };
        records.push(ExpenseRecord::stamped(
            fields,
            year,
            &shape.id_field,
            &shape.year_stamp_field,
        ));
    }

    Ok(FetchBatch { year, records })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Production source backed by the public transparency endpoint.
pub struct ApiYearSource {
    endpoint: EndpointConfig,
    shape: RecordShape,
    http: Arc<HttpFetcher>,
    archive: Option<ResponseArchive>,
}

impl ApiYearSource {
    pub fn new(endpoint: EndpointConfig, shape: RecordShape, http: Arc<HttpFetcher>) -> Self {
        Self {
            endpoint,
            shape,
            http,
            archive: None,
        }
    }

    /// Keeps a copy of every successful response body.
    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    async fn archive_body(&self, year: FiscalYear, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        let key = ResponseKey {
            api_name: &self.endpoint.api_name,
            year,
        };
        match archive.archive(key, Utc::now(), body).await {
            Ok(archived) => debug!(
                path = %archived.path.display(),
                reused = archived.reused,
                "archived raw response"
            ),
            Err(err) => warn!(error = %format!("{err:#}"), %year, "failed to archive raw response"),
        }
    }
}

#[async_trait]
impl YearSource for ApiYearSource {
    fn label(&self) -> String {
        format!("{} ({})", self.endpoint.api_name, self.endpoint.url)
    }

    async fn fetch(&self, run_id: Uuid, year: FiscalYear) -> Result<FetchBatch, SourceError> {
        let label = format!("{}-{}", self.endpoint.api_name, year);
        let request = self.endpoint.request_for(year);

        let response = self
            .http
            .fetch(run_id, &label, &request)
            .await
            .map_err(|source| SourceError::Transport { year, source })?;

        self.archive_body(year, &response.body).await;

        let batch = parse_payload(&response.body, year, &self.shape)?;
        if batch.is_empty() {
            info!(%run_id, %year, "no data for year {year}");
        } else {
            info!(%run_id, %year, records = batch.len(), attempts = response.attempts, "fetched year");
        }
        Ok(batch)
    }
}
