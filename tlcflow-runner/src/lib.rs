//! tlcflow runner: turns the core data path into a scheduled pipeline.
//!
//! - Operators and the linear task chain they form
//! - Monthly schedule and logical-date arithmetic
//! - Whole-task retry policy
//! - Exclusive run lock and JSONL run history
//! - Failure/retry alerts
//! - The runner itself: single runs, catch-up, backfill

pub mod alert;
pub mod definition;
pub mod history;
pub mod lock;
pub mod operator;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod schedule;

pub use alert::{Alert, AlertKind, AlertNotifier, AlertPolicy, LogNotifier, OutboxNotifier};
pub use definition::{DefinitionError, PipelineDefinition};
pub use history::{HistoryError, RunHistory, RunRecord, RunState, TaskRecord, TaskState};
pub use lock::{LockError, RunLock};
pub use operator::{
    EmptyOperator, Operator, TaskContext, TaskError, TaskOutput, TransferOperator,
    WarehouseLoadOperator,
};
pub use pipeline::{
    trip_data_pipeline, PipelineServices, TASK_DOWNLOAD, TASK_END, TASK_LOAD, TASK_START,
};
pub use retry::RetryPolicy;
pub use runner::{PipelineRunner, RunOutcome, RunnerError};
pub use schedule::MonthlySchedule;

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<PipelineRunner>();
        require_sync::<PipelineRunner>();
        require_send::<PipelineDefinition>();
        require_sync::<PipelineDefinition>();
        require_send::<RunRecord>();
        require_sync::<RunRecord>();
        require_send::<TaskError>();
    }
}
