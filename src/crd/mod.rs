//! Custom resource definitions for the `mcall.io/v1` API group.

pub mod task;
pub mod workflow;

pub use task::{Task, TaskKind, TaskPhase, TaskResult, TaskSpec, TaskStatus};
pub use workflow::{Workflow, WorkflowPhase, WorkflowSpec, WorkflowStatus};

/// API group shared by both resource kinds.
pub const API_GROUP: &str = "mcall.io";

/// Annotation carrying a child Task's JSON-encoded skip condition. The
/// Workflow reconciler writes it so that user-created Tasks never inherit
/// workflow-only semantics through their spec.
pub const CONDITION_ANNOTATION: &str = "mcall.io/condition";

/// Finalizer attached to both kinds so deletion is observable and final
/// results can be drained.
pub const FINALIZER: &str = "mcall.io/cleanup";

/// Label tying a child Task back to its owning Workflow.
pub const WORKFLOW_LABEL: &str = "mcall.io/workflow";

/// Label carrying the child's local name within the Workflow graph.
pub const LOCAL_NAME_LABEL: &str = "mcall.io/task";

/// Deterministic name of the child Task materialized for a workflow-local
/// task name.
pub fn child_name(workflow: &str, local_name: &str) -> String {
    format!("{}-{}", workflow, local_name)
}
