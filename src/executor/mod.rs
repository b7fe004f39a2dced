//! Trial execution and job orchestration.
//!
//! [`trial`] drives one (agent, task, attempt) triple through the
//! six-phase state machine; [`orchestrator`] expands a job config into
//! trials, fans them out over a worker pool, and aggregates the results.

pub mod orchestrator;
pub mod trial;

pub use orchestrator::{
    default_executor_factory, run_from_config, ExecutorFactory, JobOrchestrator,
};
pub use trial::{TrialExecutor, TrialRunner, INSTRUCTION_ENV_VAR};
