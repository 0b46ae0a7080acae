//! Task graph: stage vocabulary, the DAG itself, and the per-request builder.

pub mod builder;
pub mod error;
pub mod stage;
pub mod task_graph;

pub use builder::{GraphOptions, GraphShape, StageDefaults, StageOverride, TaskGraphBuilder};
pub use error::{GraphError, GraphResult};
pub use stage::{Requirement, RetryPolicy, StageId, StageKind, StageSpec, StageStatus};
pub use task_graph::TaskGraph;
