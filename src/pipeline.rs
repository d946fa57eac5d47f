//! One end-to-end run: acquire, flatten, derive features, persist.

use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::features::{build_feature_schema, FeatureEngine, FeatureError, FeatureSchema};
use crate::flatten::{attach_entity_attributes, flatten_histories};
use crate::ingest::{
    build_http_client, BatchFetchReport, Catalog, IngestConfig, IngestError, Ingestor, RawHistory,
};
use crate::persist::{ParquetPersister, PersistError};

#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredData {
    pub catalog: Catalog,
    pub histories: Vec<RawHistory>,
    pub report: BatchFetchReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub fetch: BatchFetchReport,
    pub flattened_rows: usize,
    pub training_rows: usize,
    pub schema: FeatureSchema,
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("acquisition failed: {0}")]
    Ingest(#[from] IngestError),
    #[error("feature derivation failed: {0}")]
    Features(#[from] FeatureError),
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),
}

/// Fetches the catalog and every listed entity history with one client,
/// released on both success and failure.
pub async fn run_ingestion(cfg: &IngestConfig) -> Result<AcquiredData, IngestError> {
    let client = build_http_client(cfg)?;
    let ingestor = Ingestor::new(client, cfg.clone())?;

    let result = async {
        let catalog = ingestor.fetch_catalog().await?;
        let ids = catalog.entity_ids();
        info!(
            component = "pipeline",
            event = "pipeline.ingest.entities",
            entity_count = ids.len(),
            "fetching history for {} entities",
            ids.len()
        );
        let batch = ingestor.fetch_all_histories(&ids).await;
        Ok::<_, IngestError>(AcquiredData {
            catalog,
            histories: batch.histories,
            report: batch.report,
        })
    }
    .await;

    ingestor.close();
    result
}

pub async fn run_pipeline(cfg: &PipelineConfig) -> Result<PipelineSummary, PipelineError> {
    let engine = FeatureEngine::new(cfg.features.clone())?;
    let schema = build_feature_schema(engine.config());
    let persister = ParquetPersister::new(&cfg.output_dir)?;

    info!(
        component = "pipeline",
        event = "pipeline.start",
        output_dir = %persister.output_dir().display(),
        output_name = %cfg.output_name
    );

    let acquired = match run_ingestion(&cfg.ingest).await {
        Ok(acquired) => acquired,
        Err(err) => {
            error!(
                component = "pipeline",
                event = "pipeline.failed",
                step = "ingest",
                error = %err
            );
            return Err(err.into());
        }
    };

    let flat = flatten_histories(acquired.histories.iter().map(|history| &history.body));
    let flattened_rows = flat.len();
    if flat.is_empty() {
        warn!(
            component = "pipeline",
            event = "pipeline.nothing_to_process",
            requested = acquired.report.requested,
            succeeded = acquired.report.succeeded
        );
        return Ok(PipelineSummary {
            fetch: acquired.report,
            flattened_rows,
            training_rows: 0,
            schema,
            artifact: None,
        });
    }

    let flat = attach_entity_attributes(
        flat,
        &acquired.catalog,
        &engine.config().entity_column,
        &engine.config().categorical_columns,
    );
    let enriched = engine.engineer(&flat)?;
    let training = engine.prepare_for_training(enriched)?;

    let metadata = vec![
        ("fpl.schema_version".to_string(), schema.version.to_string()),
        ("fpl.schema_fingerprint".to_string(), schema.fingerprint.clone()),
        (
            "fpl.generated_at_utc".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ];
    let artifact = persister.write_with_metadata(&training, &cfg.output_name, &metadata)?;

    let summary = PipelineSummary {
        fetch: acquired.report,
        flattened_rows,
        training_rows: training.len(),
        schema,
        artifact,
    };

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        requested = summary.fetch.requested,
        succeeded = summary.fetch.succeeded,
        failed = summary.fetch.failed,
        flattened_rows = summary.flattened_rows,
        training_rows = summary.training_rows,
        artifact = ?summary.artifact
    );

    Ok(summary)
}
