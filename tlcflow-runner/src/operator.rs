//! Pipeline steps.
//!
//! Every node of the pipeline implements [`Operator`]. An operator gets the
//! immutable run context plus the outputs of the tasks that already finished,
//! and either produces a [`TaskOutput`] or fails with a [`TaskError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tlcflow_core::transfer::{TransferError, TransferReport, TransferStep};
use tlcflow_core::warehouse::{
    LoadError, LoadReport, LoadRequest, TableRef, TableSchema, WarehouseLoader, WriteDisposition,
};
use tlcflow_core::RunContext;

/// What a task hands to the tasks after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Marker,
    Transferred(TransferReport),
    Loaded(LoadReport),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("warehouse load failed: {0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Only configuration problems are final; the rest get whole-task retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Transfer(e) => e.is_retryable(),
            TaskError::Load(_) | TaskError::Failed(_) => true,
        }
    }
}

pub struct TaskContext<'a> {
    pub run: &'a RunContext,
    /// 1-based attempt number.
    pub attempt: u32,
    pub upstream: &'a BTreeMap<String, TaskOutput>,
}

pub trait Operator: Send + Sync {
    fn task_id(&self) -> &str;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskError>;
}

/// Structural no-op marking the start or end of the chain.
pub struct EmptyOperator {
    task_id: String,
}

impl EmptyOperator {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
        }
    }
}

impl Operator for EmptyOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn execute(&self, _ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput::Marker)
    }
}

/// Fetch, normalize and upload the month's source file.
pub struct TransferOperator {
    task_id: String,
    step: TransferStep,
}

impl TransferOperator {
    pub fn new(task_id: impl Into<String>, step: TransferStep) -> Self {
        Self {
            task_id: task_id.into(),
            step,
        }
    }
}

impl Operator for TransferOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskError> {
        let report = self.step.transfer(ctx.run)?;
        Ok(TaskOutput::Transferred(report))
    }
}

/// Append the month's object to the destination table.
///
/// The object key comes from the run context, the same pure function of
/// (service, logical date) the transfer used, so the load does not depend on
/// the transfer's in-memory output.
pub struct WarehouseLoadOperator {
    task_id: String,
    loader: Arc<dyn WarehouseLoader>,
    destination: TableRef,
    schema: TableSchema,
    write_disposition: WriteDisposition,
}

impl WarehouseLoadOperator {
    pub fn new(
        task_id: impl Into<String>,
        loader: Arc<dyn WarehouseLoader>,
        destination: TableRef,
        schema: TableSchema,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            loader,
            destination,
            schema,
            write_disposition: WriteDisposition::Append,
        }
    }

    pub fn with_write_disposition(mut self, disposition: WriteDisposition) -> Self {
        self.write_disposition = disposition;
        self
    }
}

impl Operator for WarehouseLoadOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput, TaskError> {
        let mut request = LoadRequest::append_csv(
            ctx.run.bucket(),
            ctx.run.destination_object(),
            self.destination.clone(),
            self.schema.clone(),
        );
        request.write_disposition = self.write_disposition;

        let report = self.loader.load(&request)?;
        tracing::info!(
            table = %report.destination,
            rows = report.rows_loaded,
            job_id = %report.job_id,
            loader = self.loader.name(),
            "load finished"
        );
        Ok(TaskOutput::Loaded(report))
    }
}
