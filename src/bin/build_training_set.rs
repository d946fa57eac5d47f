use fpl_features::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env, run_pipeline,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    let _log_guard = init_logging(&logging_cfg)?;

    let cfg = pipeline_config_from_env();
    log_app_start(&logging_cfg, &cfg);

    let summary = run_pipeline(&cfg).await?;

    match &summary.artifact {
        Some(path) => println!(
            "Training set written | path={} rows={} fetched={}/{} schema={}",
            path.display(),
            summary.training_rows,
            summary.fetch.succeeded,
            summary.fetch.requested,
            summary.schema.fingerprint
        ),
        None => println!(
            "Nothing to persist | fetched={}/{} flattened_rows={}",
            summary.fetch.succeeded, summary.fetch.requested, summary.flattened_rows
        ),
    }

    Ok(())
}
