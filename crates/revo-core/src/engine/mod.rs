//! Workflow engine and the per-request state it drives.

pub mod state;
pub mod workflow;

pub use state::{
    RequestPhase, RequestState, ResultStatus, StageRecord, StageResult, StageSnapshot,
    StatusSnapshot,
};
pub use workflow::WorkflowEngine;
