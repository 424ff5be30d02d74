//! The four executors behind one capability: given a kind, an input, an
//! environment, and a deadline, produce a structured result. Dispatch is a
//! match over the tagged [`TaskKind`] variant; every arm returns the shared
//! [`ExecutionOutcome`] shape.

pub mod command;
pub mod http;
pub mod remote;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::crd::task::{ERROR_CODE_FAILED, ERROR_CODE_OK, TaskKind, ValidationSpec};

/// Persisted outputs are bounded at 10 KiB before the truncation suffix.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024;

/// Result shape shared by all executors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub error_code: String,
    pub error_message: String,
    pub http_status_code: Option<u16>,
}

impl ExecutionOutcome {
    pub fn success(output: String) -> Self {
        Self {
            output,
            error_code: ERROR_CODE_OK.to_string(),
            error_message: String::new(),
            http_status_code: None,
        }
    }

    pub fn failure(output: String, error_message: impl Into<String>) -> Self {
        Self {
            output,
            error_code: ERROR_CODE_FAILED.to_string(),
            error_message: error_message.into(),
            http_status_code: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error_code == ERROR_CODE_OK
    }
}

/// One attempt's worth of work, fully resolved: templates rendered, secrets
/// and source values already merged into `env`, remote credentials already
/// dereferenced.
pub struct ExecutionRequest<'a> {
    pub kind: TaskKind,
    pub input: &'a str,
    pub env: &'a BTreeMap<String, String>,
    pub deadline: Duration,
    pub validation: Option<&'a ValidationSpec>,
    pub remote: Option<remote::ResolvedRemoteCall>,
}

/// Run one attempt under the per-attempt deadline.
pub async fn execute(request: ExecutionRequest<'_>) -> ExecutionOutcome {
    match request.kind {
        // The command executor owns its deadline so it can kill the whole
        // process group before giving up.
        TaskKind::Command => {
            command::run(request.input, request.env, request.deadline, request.validation).await
        }
        TaskKind::HttpGet => {
            with_deadline(
                request.deadline,
                http::get(request.input, request.validation, request.deadline),
            )
            .await
        }
        TaskKind::HttpPost => {
            with_deadline(
                request.deadline,
                http::post(request.input, request.validation, request.deadline),
            )
            .await
        }
        TaskKind::RemoteCall => match request.remote {
            Some(config) => with_deadline(request.deadline, remote::run(config)).await,
            None => ExecutionOutcome::failure(
                String::new(),
                "remoteCall task has no remoteConfig",
            ),
        },
    }
}

async fn with_deadline(
    deadline: Duration,
    work: impl Future<Output = ExecutionOutcome>,
) -> ExecutionOutcome {
    match tokio::time::timeout(deadline, work).await {
        Ok(outcome) => outcome,
        Err(_) => ExecutionOutcome::failure(String::new(), "deadline exceeded"),
    }
}

/// Bound a result text at [`MAX_OUTPUT_BYTES`], appending the original size
/// when truncated.
pub fn truncate_output(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}... [truncated, original length: {} bytes]",
        &text[..cut],
        text.len()
    )
}
