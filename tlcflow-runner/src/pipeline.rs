//! The monthly trip-data pipeline:
//! `start -> download_to_gcs -> load_gcs_to_bigquery -> end`.

use std::sync::Arc;

use tlcflow_core::transfer::{TransferOptions, TransferStep};
use tlcflow_core::warehouse::TableSchema;
use tlcflow_core::{ConfigError, ObjectStore, PipelineConfig, SourceFetcher, WarehouseLoader};

use crate::alert::{AlertNotifier, AlertPolicy};
use crate::definition::PipelineDefinition;
use crate::operator::{EmptyOperator, TransferOperator, WarehouseLoadOperator};
use crate::retry::RetryPolicy;
use crate::runner::PipelineRunner;
use crate::schedule::MonthlySchedule;

pub const TASK_START: &str = "start";
pub const TASK_DOWNLOAD: &str = "download_to_gcs";
pub const TASK_LOAD: &str = "load_gcs_to_bigquery";
pub const TASK_END: &str = "end";

/// Backends the pipeline talks to.
pub struct PipelineServices {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn WarehouseLoader>,
    pub notifier: Arc<dyn AlertNotifier>,
}

/// Wire the configured pipeline into a runner.
pub fn trip_data_pipeline(
    config: &PipelineConfig,
    services: PipelineServices,
) -> Result<PipelineRunner, ConfigError> {
    let schedule = MonthlySchedule::parse(&config.pipeline.schedule)?;
    let locator = config.locator()?;
    let bucket = config.bucket()?;

    let step = TransferStep::new(
        services.fetcher,
        services.store,
        TransferOptions {
            workspace_root: config.runtime.workspace_root.clone(),
            content_type: config.storage.content_type.clone(),
        },
    );
    let load = WarehouseLoadOperator::new(
        TASK_LOAD,
        services.warehouse,
        config.table(),
        TableSchema::green_trips(),
    );

    let definition = PipelineDefinition::chain(config.pipeline.dag_id.clone())
        .description(config.pipeline.description.clone())
        .tags(config.pipeline.tags.clone())
        .then(Arc::new(EmptyOperator::new(TASK_START)))
        .then(Arc::new(TransferOperator::new(TASK_DOWNLOAD, step)))
        .then(Arc::new(load))
        .then(Arc::new(EmptyOperator::new(TASK_END)))
        .build()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    Ok(PipelineRunner::new(
        definition,
        schedule,
        config.pipeline.start_date,
        locator,
        bucket,
        config.runtime.state_dir.clone(),
        services.notifier,
    )
    .with_catchup(config.pipeline.catchup)
    .with_retry(RetryPolicy::from(&config.retry))
    .with_alerts(AlertPolicy::from(&config.alert))
    .with_workspace_root(config.runtime.workspace_root.clone()))
}
