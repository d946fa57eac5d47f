//! FPL training-set builder core crate.
//!
//! Current implemented scope:
//! - concurrent catalog and per-player history acquisition with isolated failures
//! - flattening of nested history payloads into a per-round table
//! - leakage-safe lag and trailing-mean features
//! - Parquet persistence of the training table

mod config;
mod features;
mod flatten;
mod ingest;
mod observability;
mod persist;
mod pipeline;
mod table;

pub use config::{
    pipeline_config_from_env, pipeline_config_from_lookup, PipelineConfig, DEFAULT_OUTPUT_DIR,
    DEFAULT_OUTPUT_NAME,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, lag_column, lag_series, rolling_column,
    trailing_means, EntityGroups, FeatureColumn, FeatureConfig, FeatureDType, FeatureEngine,
    FeatureError, FeatureSchema, InvalidKeyPolicy, RoundCollisionPolicy,
    DEFAULT_CATEGORICAL_COLUMNS, DEFAULT_ROLLING_WINDOWS, DEFAULT_TRACKED_STATS,
    FEATURE_SCHEMA_VERSION,
};
pub use flatten::{attach_entity_attributes, flatten_histories, HISTORY_FIELD};
pub use ingest::{
    build_http_client, BatchFetchReport, Catalog, CatalogEntity, EntityId,
    HistoryBatch, IngestConfig, IngestError, Ingestor, RawHistory, FPL_API_BASE_URL,
};
pub use observability::{
    filter_directives, init_logging, log_app_start, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError, DEFAULT_LOG_DIR,
    LOG_FILE_PREFIX,
};
pub use persist::{table_to_record_batch, ParquetPersister, PersistError, PARQUET_EXTENSION};
pub use pipeline::{run_ingestion, run_pipeline, AcquiredData, PipelineError, PipelineSummary};
pub use table::{FieldValue, Row, Table};
