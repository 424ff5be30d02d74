use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::task::TaskPhase;

/// How many completed-run DAG snapshots a Workflow retains.
pub const HISTORY_LIMIT: usize = 5;

/// A DAG of Task instantiations sharing a lifecycle, optionally
/// cron-scheduled. Child Tasks are materialized from blueprints and owned by
/// the Workflow for cascade deletion.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "mcall.io",
    version = "v1",
    kind = "Workflow",
    namespaced,
    status = "WorkflowStatus",
    shortname = "wf",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"LastRun","type":"string","jsonPath":".status.lastRunTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default)]
    pub tasks: Vec<WorkflowTask>,

    /// Five-field cron expression; each fire resets the workflow and
    /// re-materializes the graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Advisory cap on children allowed in Running at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,

    /// Default per-attempt deadline for children whose blueprint leaves it
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Environment overlaid onto every child.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Advisory resource hints, recorded but not enforced by the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHints>,
}

/// One task instantiation within the graph. `templateRef` names a Task
/// resource used as a blueprint; the reconciler copies its spec and overlays
/// the fields below, rewriting local names to prefixed child names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub local_name: String,
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<TaskCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_sources: Vec<crate::crd::task::InputSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub name: String,
    /// Defaults to the Workflow's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Overrides every child's retry limit when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    /// Children skip instead of running once a dependency has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Skip condition evaluated before a child leaves Pending. All present
/// predicates must hold for the child to proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskCondition {
    /// Terminal sibling the predicates are evaluated against.
    pub dependent_task: String,
    #[serde(default)]
    pub when: ConditionWhen,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_equals: Option<FieldEquals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contains: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConditionWhen {
    #[default]
    Success,
    Failure,
    Always,
    Completed,
}

impl fmt::Display for ConditionWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionWhen::Success => write!(f, "success"),
            ConditionWhen::Failure => write!(f, "failure"),
            ConditionWhen::Always => write!(f, "always"),
            ConditionWhen::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldEquals {
    pub field: ConditionField,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ConditionField {
    ErrorCode,
    Phase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_statuses: Vec<WorkflowTaskStatus>,
    /// Snapshot of the current (or last completed) run's graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagSnapshot>,
    /// Completed runs, newest first, bounded at [`HISTORY_LIMIT`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dag_history: Vec<DagSnapshot>,
}

impl WorkflowStatus {
    /// Push a completed run onto the history: newest first, deduplicated by
    /// run id, oldest evicted beyond the bound. Entries are immutable once
    /// inserted.
    pub fn record_run(&mut self, snapshot: DagSnapshot) {
        if self.dag_history.iter().any(|s| s.run_id == snapshot.run_id) {
            return;
        }
        self.dag_history.insert(0, snapshot);
        self.dag_history.truncate(HISTORY_LIMIT);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum WorkflowPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Succeeded | WorkflowPhase::Failed)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowPhase::Pending => write!(f, "Pending"),
            WorkflowPhase::Running => write!(f, "Running"),
            WorkflowPhase::Succeeded => write!(f, "Succeeded"),
            WorkflowPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-local-task snapshot mirrored into the Workflow status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTaskStatus {
    pub local_name: String,
    #[serde(default)]
    pub phase: TaskPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Graph snapshot consumed by read-only visualizers. Rebuilt on every
/// transition; a copy is frozen into `dagHistory` when the run completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagSnapshot {
    pub run_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub workflow_phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<DagNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<DagEdge>,
    #[serde(default)]
    pub metadata: DagMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagNode {
    /// Local task name.
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub phase: TaskPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub output_preview: String,
    #[serde(default)]
    pub error_code: String,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub retries: u32,
    /// Blueprint Task name.
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: DagEdgeType,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DagEdgeType {
    #[default]
    Dependency,
    Success,
    Failure,
    Always,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DagMetadata {
    pub succeeded: u32,
    pub failed: u32,
    pub running: u32,
    pub pending: u32,
    pub skipped: u32,
    pub total: u32,
}

impl Workflow {
    pub fn phase(&self) -> WorkflowPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
