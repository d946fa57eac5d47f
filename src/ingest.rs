//! Catalog and per-entity history acquisition with per-item failure isolation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const FPL_API_BASE_URL: &str = "https://fantasy.premierleague.com/api";

pub type EntityId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_concurrency: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: FPL_API_BASE_URL.to_string(),
            timeout_ms: 10_000,
            max_concurrency: None,
        }
    }
}

impl IngestConfig {
    pub fn catalog_url(&self) -> String {
        format!("{}/bootstrap-static/", self.base_url.trim_end_matches('/'))
    }

    pub fn entity_url(&self, id: EntityId) -> String {
        format!("{}/element-summary/{id}/", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub id: EntityId,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub elements: Vec<CatalogEntity>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Catalog {
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.elements.iter().map(|entity| entity.id).collect()
    }

    pub fn entity(&self, id: EntityId) -> Option<&CatalogEntity> {
        self.elements.iter().find(|entity| entity.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHistory {
    pub entity_id: EntityId,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFetchReport {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBatch {
    pub histories: Vec<RawHistory>,
    pub report: BatchFetchReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntityFetchOutcome {
    Fetched(Value),
    NonSuccess(u16),
    TransportError(String),
    DecodeError(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid ingest config: {0}")]
    InvalidConfig(String),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("catalog request failed for {url}: {message}")]
    CatalogRequest { url: String, message: String },
    #[error("catalog request to {url} returned HTTP status {status}")]
    CatalogStatus { url: String, status: u16 },
    #[error("catalog body from {url} is malformed: {message}")]
    CatalogDecode { url: String, message: String },
}

pub fn build_http_client(cfg: &IngestConfig) -> Result<reqwest::Client, IngestError> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .build()
        .map_err(|err| IngestError::HttpClientBuild(err.to_string()))
}

/// Owns one HTTP client for the duration of a run.
#[derive(Debug)]
pub struct Ingestor {
    client: reqwest::Client,
    cfg: IngestConfig,
}

impl Ingestor {
    pub fn new(client: reqwest::Client, cfg: IngestConfig) -> Result<Self, IngestError> {
        if cfg.max_concurrency == Some(0) {
            return Err(IngestError::InvalidConfig(
                "max_concurrency must be >= 1 when set".to_string(),
            ));
        }
        if cfg.timeout_ms == 0 {
            return Err(IngestError::InvalidConfig(
                "timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(Self { client, cfg })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    pub async fn fetch_catalog(&self) -> Result<Catalog, IngestError> {
        let url = self.cfg.catalog_url();
        info!(
            component = "ingest",
            event = "ingest.catalog.start",
            url = %url
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| IngestError::CatalogRequest {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::CatalogStatus {
                url,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| IngestError::CatalogRequest {
                url: url.clone(),
                message: err.to_string(),
            })?;
        let catalog: Catalog =
            serde_json::from_slice(&bytes).map_err(|err| IngestError::CatalogDecode {
                url: url.clone(),
                message: err.to_string(),
            })?;

        info!(
            component = "ingest",
            event = "ingest.catalog.finish",
            entity_count = catalog.elements.len()
        );

        Ok(catalog)
    }

    pub async fn fetch_entity_history(&self, id: EntityId) -> Option<RawHistory> {
        fetch_entity_history_with_client(&self.client, &self.cfg, id).await
    }

    pub async fn fetch_all_histories(&self, ids: &[EntityId]) -> HistoryBatch {
        info!(
            component = "ingest",
            event = "ingest.batch.start",
            requested = ids.len(),
            max_concurrency = ?self.cfg.max_concurrency
        );

        let limiter = self
            .cfg
            .max_concurrency
            .map(|permits| Arc::new(Semaphore::new(permits)));
        let mut tasks = JoinSet::new();

        for &id in ids {
            let client = self.client.clone();
            let cfg = self.cfg.clone();
            let limiter = limiter.clone();
            tasks.spawn(async move {
                let _permit = match limiter {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                fetch_entity_history_with_client(&client, &cfg, id).await
            });
        }

        let mut histories = Vec::with_capacity(ids.len());
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(history)) => histories.push(history),
                Ok(None) => failed += 1,
                Err(err) => {
                    error!(
                        component = "ingest",
                        event = "ingest.entity.task_failed",
                        error = %err
                    );
                    failed += 1;
                }
            }
        }

        let report = BatchFetchReport {
            requested: ids.len(),
            succeeded: histories.len(),
            failed,
        };
        info!(
            component = "ingest",
            event = "ingest.batch.finish",
            requested = report.requested,
            succeeded = report.succeeded,
            failed = report.failed,
            "fetched {}/{} entity histories",
            report.succeeded,
            report.requested
        );

        HistoryBatch { histories, report }
    }

    /// Releases the underlying connection pool.
    pub fn close(self) {
        drop(self.client);
        debug!(component = "ingest", event = "ingest.client.closed");
    }
}

async fn fetch_entity_history_with_client(
    client: &reqwest::Client,
    cfg: &IngestConfig,
    id: EntityId,
) -> Option<RawHistory> {
    let url = cfg.entity_url(id);
    match fetch_entity_outcome(client, &url).await {
        EntityFetchOutcome::Fetched(body) => Some(RawHistory {
            entity_id: id,
            body,
        }),
        EntityFetchOutcome::NonSuccess(status) => {
            warn!(
                component = "ingest",
                event = "ingest.entity.non_success",
                entity_id = id,
                status
            );
            None
        }
        EntityFetchOutcome::TransportError(message) => {
            error!(
                component = "ingest",
                event = "ingest.entity.transport_error",
                entity_id = id,
                error = %message
            );
            None
        }
        EntityFetchOutcome::DecodeError(message) => {
            error!(
                component = "ingest",
                event = "ingest.entity.decode_error",
                entity_id = id,
                error = %message
            );
            None
        }
    }
}

async fn fetch_entity_outcome(client: &reqwest::Client, url: &str) -> EntityFetchOutcome {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(err) => return EntityFetchOutcome::TransportError(err.to_string()),
    };

    let status = response.status();
    if !status.is_success() {
        return EntityFetchOutcome::NonSuccess(status.as_u16());
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return EntityFetchOutcome::TransportError(err.to_string()),
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(body) => EntityFetchOutcome::Fetched(body),
        Err(err) => EntityFetchOutcome::DecodeError(err.to_string()),
    }
}
