use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::workflow::TaskCondition;

/// `errorCode` carried by a result on success.
pub const ERROR_CODE_OK: &str = "0";
/// `errorCode` carried by a result on failure.
pub const ERROR_CODE_FAILED: &str = "-1";

/// A single unit of side-effectful work: a command line, an HTTP request, or
/// a remote JSON-RPC tool call. Mutated only in status by the Task
/// reconciler.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "mcall.io",
    version = "v1",
    kind = "Task",
    namespaced,
    status = "TaskStatus",
    shortname = "tk",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Which executor handles this task.
    pub kind: TaskKind,

    /// Command line, URL, or remote server URL depending on `kind`.
    #[serde(default)]
    pub input: String,

    /// Per-attempt deadline in seconds. Falls back to the process-level
    /// `TASK_TIMEOUT` default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Additional attempts after the first failure.
    #[serde(default)]
    pub retry_limit: u32,

    /// Optional five-field cron expression gating when the task becomes
    /// eligible to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Sibling Task names that must reach a terminal phase before this one
    /// starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Literal environment variables for the execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Environment variables injected from the cluster secret store.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_bindings: Vec<SecretBinding>,

    /// Optional predicate over the executor result; failing it marks the
    /// attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,

    /// Values pulled from sibling Task results before the task starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_sources: Vec<InputSource>,

    /// When present, the rendered template replaces `input` for the attempt;
    /// otherwise resolved source values are merged into the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<String>,

    /// Remote JSON-RPC configuration, required for `kind: remoteCall`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config: Option<RemoteConfig>,

    /// Skip instead of running when a dependency failed.
    #[serde(default)]
    pub fail_fast: bool,
}

/// Executor selector. A tagged variant with one shared result shape, not a
/// trait hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Command,
    HttpGet,
    HttpPost,
    RemoteCall,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Command => write!(f, "command"),
            TaskKind::HttpGet => write!(f, "httpGet"),
            TaskKind::HttpPost => write!(f, "httpPost"),
            TaskKind::RemoteCall => write!(f, "remoteCall"),
        }
    }
}

/// One environment variable sourced from a Secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretBinding {
    pub env_var_name: String,
    pub secret_ref: String,
    pub secret_key: String,
    /// Used when the secret or key is absent; without it the task fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// One value pulled from a sibling Task's observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputSource {
    /// Variable name the resolved value binds to.
    pub name: String,
    /// Sibling Task the value is read from.
    pub task_ref: String,
    #[serde(default)]
    pub field: InputField,
    /// `$.a.b.c` expression applied to `output` when the field is `output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_expr: Option<String>,
    /// Used when the reference is missing, non-terminal, or extraction fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum InputField {
    #[default]
    Output,
    ErrorCode,
    Phase,
    ErrorMessage,
    All,
}

/// Remote JSON-RPC tool-call configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub server_url: String,
    pub tool_name: String,
    /// Free-form arguments object forwarded to the tool.
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RemoteAuth>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_seconds: Option<u64>,
}

/// How the remote server authenticates us. Credential values live in the
/// secret store and are resolved just before dispatch; they never appear in
/// the spec or in logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAuth {
    #[serde(default)]
    pub auth_type: RemoteAuthType,
    /// Header name for `apiKey` auth. Defaults to `X-API-Key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum RemoteAuthType {
    #[default]
    None,
    ApiKey,
    Bearer,
    Basic,
}

/// Result predicates applied after the executor returns and before the retry
/// decision. HTTP-flavored fields apply to `httpGet`/`httpPost`, the rest to
/// `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSpec {
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_status: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_body: Option<String>,
    #[serde(default)]
    pub body_match: MatchMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_headers: Vec<HeaderExpectation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub output_match: OutputMatchMode,
    /// Path for `outputMatch: jsonPath` equality checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Compile regexes in multi-line mode.
    #[serde(default)]
    pub multiline: bool,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    /// Minimum number of output lines required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_lines: Option<usize>,
    /// Substring whose presence marks the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_indicator: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            follow_redirects: false,
            max_redirects: None,
            expected_status: Vec::new(),
            expected_body: None,
            body_match: MatchMode::default(),
            expected_headers: Vec::new(),
            expected_output: None,
            output_match: OutputMatchMode::default(),
            json_path: None,
            multiline: false,
            case_sensitive: true,
            min_lines: None,
            failure_indicator: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum MatchMode {
    Exact,
    #[default]
    Contains,
    Regex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum OutputMatchMode {
    Exact,
    #[default]
    Contains,
    Regex,
    JsonPath,
}

/// Case-insensitive header presence check; the value must contain the given
/// substring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderExpectation {
    pub name: String,
    pub contains: String,
}

/// Observed state. Written only by the Task reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub phase: TaskPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_millis: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    /// Written exactly once, atomically with the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_time: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TaskPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::Skipped
        )
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPhase::Pending => write!(f, "Pending"),
            TaskPhase::Running => write!(f, "Running"),
            TaskPhase::Succeeded => write!(f, "Succeeded"),
            TaskPhase::Failed => write!(f, "Failed"),
            TaskPhase::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Structured outcome of the final attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
}

impl TaskResult {
    pub fn success(output: String) -> Self {
        Self {
            output,
            error_code: ERROR_CODE_OK.to_string(),
            error_message: String::new(),
        }
    }

    pub fn failure(output: String, error_message: String) -> Self {
        Self {
            output,
            error_code: ERROR_CODE_FAILED.to_string(),
            error_message,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            output: String::new(),
            error_code: ERROR_CODE_OK.to_string(),
            error_message: format!("skipped: {}", reason),
        }
    }
}

impl Task {
    /// Observed phase, defaulting to Pending for a fresh object.
    pub fn phase(&self) -> TaskPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Skip condition attached by the Workflow reconciler, if any.
    pub fn run_condition(&self) -> Result<Option<TaskCondition>, serde_json::Error> {
        match self.annotations().get(crate::crd::CONDITION_ANNOTATION) {
            Some(raw) => serde_json::from_str(raw).map(Some),
            None => Ok(None),
        }
    }
}
