//! The Task reconciler: dependency gate, skip condition, input resolution,
//! executor dispatch, retry bookkeeping, terminal write-back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event, finalizer};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cli::config::OperatorConfig;
use crate::controllers::{Ctx, WORKER_DEADLINE_SECS, now_rfc3339, parse_time};
use crate::crd::task::{InputField, InputSource, RemoteAuthType, TaskPhase, TaskResult, TaskSpec};
use crate::crd::{FINALIZER, Task};
use crate::engine::{condition, jsonpath, schedule, template};
use crate::error::{Error, Result};
use crate::executors::remote::ResolvedRemoteCall;
use crate::executors::{self, ExecutionRequest, remote};
use crate::repository;

/// Requeue interval while a dependency or source reference is not yet
/// terminal.
const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(30);

pub async fn reconcile(task: Arc<Task>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = task.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Task> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, task, |event| async {
        match event {
            Event::Apply(task) => apply(task, &api, &ctx, &namespace).await,
            Event::Cleanup(task) => cleanup(task).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

pub fn error_policy(task: Arc<Task>, error: &Error, ctx: Arc<Ctx>) -> Action {
    let key = object_key(&task);
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        task = %key,
        error = %error,
        delay_ms = delay.as_millis() as u64,
        "reconciliation error, backing off"
    );
    Action::requeue(delay)
}

/// Drain the final result into the log before the finalizer is released and
/// the object disappears.
async fn cleanup(task: Arc<Task>) -> Result<Action> {
    if let Some(result) = task.status.as_ref().and_then(|s| s.result.as_ref()) {
        info!(
            task = %object_key(&task),
            phase = %task.phase(),
            error_code = %result.error_code,
            "draining final result before deletion"
        );
    }
    Ok(Action::await_change())
}

async fn apply(task: Arc<Task>, api: &Api<Task>, ctx: &Ctx, namespace: &str) -> Result<Action> {
    let name = task.name_any();
    // Work from a fresh snapshot; the cached object can lag our own writes.
    let Some(current) = api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };
    let key = format!("{}/{}", namespace, name);

    let phase = current.phase();
    if phase.is_terminal() {
        // Re-reconciling a terminal task is a no-op on status.
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    if phase == TaskPhase::Pending {
        if let Some(action) = gate_schedule(&current, api, &key).await? {
            return Ok(action);
        }

        match dependency_gate(&current, api).await? {
            Gate::Wait(reason) => {
                debug!(task = %key, reason = %reason, "dependencies not ready");
                return Ok(Action::requeue(DEPENDENCY_REQUEUE));
            }
            Gate::Skip(reason) => return skip_terminal(api, &current, &key, &reason).await,
            Gate::Ready => {}
        }

        match current.run_condition() {
            Err(e) => {
                return fail_terminal(
                    api,
                    &current,
                    &key,
                    format!("invalid condition annotation: {}", e),
                )
                .await;
            }
            Ok(None) => {}
            Ok(Some(condition)) => {
                let Some(dependent) = api.get_opt(&condition.dependent_task).await? else {
                    debug!(task = %key, dependent = %condition.dependent_task, "condition dependent not found yet");
                    return Ok(Action::requeue(DEPENDENCY_REQUEUE));
                };
                let dependent_phase = dependent.phase();
                if !dependent_phase.is_terminal() {
                    return Ok(Action::requeue(DEPENDENCY_REQUEUE));
                }
                let dependent_result = dependent.status.as_ref().and_then(|s| s.result.as_ref());
                let verdict = condition::evaluate(&condition, dependent_phase, dependent_result);
                if !verdict.proceed {
                    return skip_terminal(api, &current, &key, &verdict.reason).await;
                }
            }
        }
    }

    // A Pending task that cleared the gates and a Running one (retry after
    // backoff, or crash recovery) both execute an attempt from freshly
    // resolved inputs.
    let resolved = match resolve_attempt(&current, api, ctx, namespace).await? {
        Resolution::Ready(resolved) => resolved,
        Resolution::Wait(reason) => {
            debug!(task = %key, reason = %reason, "input sources not ready");
            return Ok(Action::requeue(DEPENDENCY_REQUEUE));
        }
        Resolution::Fail(reason) => return fail_terminal(api, &current, &key, reason).await,
    };

    let mut status = current.status.clone().unwrap_or_default();
    if status.phase != TaskPhase::Running {
        status.phase = TaskPhase::Running;
        status.start_time = Some(now_rfc3339());
        repository::update_task_status(api, &name, status.clone()).await?;
        info!(
            task = %key,
            kind = %current.spec.kind,
            attempt = status.retry_count + 1,
            "dispatching executor"
        );
    }

    let deadline = attempt_deadline(&current.spec, &ctx.config);
    let attempt_started = std::time::Instant::now();
    let outcome = executors::execute(ExecutionRequest {
        kind: current.spec.kind,
        input: &resolved.input,
        env: &resolved.env,
        deadline,
        validation: current.spec.validation.as_ref(),
        remote: resolved.remote,
    })
    .await;
    let attempt_ms = attempt_started.elapsed().as_millis() as i64;

    ctx.backoff.reset(&key);

    if outcome.succeeded() {
        status.phase = TaskPhase::Succeeded;
        status.completion_time = Some(now_rfc3339());
        status.execution_millis = Some(execution_millis(&status, attempt_ms));
        status.http_status_code = outcome.http_status_code;
        status.result = Some(TaskResult::success(outcome.output));
        repository::update_task_status(api, &name, status).await?;
        info!(task = %key, phase = %TaskPhase::Succeeded, duration_ms = attempt_ms, "task succeeded");
        return Ok(Action::await_change());
    }

    if status.retry_count < current.spec.retry_limit {
        status.retry_count += 1;
        status.last_retry_time = Some(now_rfc3339());
        status.http_status_code = outcome.http_status_code;
        repository::update_task_status(api, &name, status.clone()).await?;
        let delay = retry_backoff(status.retry_count);
        warn!(
            task = %key,
            error = %outcome.error_message,
            retry = status.retry_count,
            limit = current.spec.retry_limit,
            delay_s = delay.as_secs(),
            "attempt failed, backing off"
        );
        return Ok(Action::requeue(delay));
    }

    status.phase = TaskPhase::Failed;
    status.completion_time = Some(now_rfc3339());
    status.execution_millis = Some(execution_millis(&status, attempt_ms));
    status.http_status_code = outcome.http_status_code;
    status.result = Some(TaskResult::failure(outcome.output, outcome.error_message.clone()));
    repository::update_task_status(api, &name, status).await?;
    info!(task = %key, phase = %TaskPhase::Failed, error = %outcome.error_message, "task failed");
    Ok(Action::await_change())
}

/// A cron-gated task stays Pending until its first fire after creation. A
/// malformed expression is a permanent, resource-level failure.
async fn gate_schedule(
    current: &Task,
    api: &Api<Task>,
    key: &str,
) -> Result<Option<Action>> {
    let Some(expr) = &current.spec.schedule else {
        return Ok(None);
    };
    let parsed = match schedule::parse(expr) {
        Ok(parsed) => parsed,
        Err(e) => {
            return fail_terminal(api, current, key, format!("{:#}", e))
                .await
                .map(Some);
        }
    };
    let created = current
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);
    if let Some(fire) = schedule::next_fire(&parsed, created) {
        let now = Utc::now();
        if now < fire {
            let wait = (fire - now).to_std().unwrap_or(Duration::from_secs(1));
            debug!(task = %key, fire = %fire, "waiting for scheduled start");
            return Ok(Some(Action::requeue(wait)));
        }
    }
    Ok(None)
}

enum Gate {
    Ready,
    Wait(String),
    Skip(String),
}

/// Every dependency must sit in a terminal phase before the task may start.
/// Skipped counts as terminal non-failure; a failed dependency only blocks
/// the task when failFast is set.
async fn dependency_gate(task: &Task, api: &Api<Task>) -> Result<Gate> {
    let mut failed_dependency = None;
    for dependency in &task.spec.dependencies {
        match api.get_opt(dependency).await? {
            None => {
                return Ok(Gate::Wait(format!("dependency '{}' not found", dependency)));
            }
            Some(sibling) => {
                let phase = sibling.phase();
                if !phase.is_terminal() {
                    return Ok(Gate::Wait(format!("dependency '{}' is {}", dependency, phase)));
                }
                if phase == TaskPhase::Failed {
                    failed_dependency = Some(dependency.clone());
                }
            }
        }
    }
    if let Some(dependency) = failed_dependency
        && task.spec.fail_fast
    {
        return Ok(Gate::Skip(format!("dependency '{}' failed", dependency)));
    }
    Ok(Gate::Ready)
}

enum Resolution {
    Ready(ResolvedAttempt),
    Wait(String),
    Fail(String),
}

struct ResolvedAttempt {
    input: String,
    env: BTreeMap<String, String>,
    remote: Option<ResolvedRemoteCall>,
}

/// Resolve everything an attempt needs: source values from siblings, the
/// rendered input, the merged environment, secret bindings, and remote
/// credentials.
async fn resolve_attempt(
    task: &Task,
    api: &Api<Task>,
    ctx: &Ctx,
    namespace: &str,
) -> Result<Resolution> {
    let mut values: BTreeMap<String, String> = BTreeMap::new();

    for source in &task.spec.input_sources {
        match resolve_source(source, api).await? {
            SourceValue::Ready(value) => {
                values.insert(source.name.clone(), value);
            }
            SourceValue::Wait(reason) => return Ok(Resolution::Wait(reason)),
            SourceValue::Fail(reason) => return Ok(Resolution::Fail(reason)),
        }
    }

    let mut env = task.spec.environment.clone();
    let input = match &task.spec.input_template {
        Some(tpl) => template::render(tpl, &values),
        None => {
            // Without a template the resolved values ride along as
            // environment variables.
            env.extend(values.clone());
            task.spec.input.clone()
        }
    };

    for binding in &task.spec.secret_bindings {
        let value =
            repository::secret_value(&ctx.client, namespace, &binding.secret_ref, &binding.secret_key)
                .await?;
        match value.or_else(|| binding.default.clone()) {
            Some(value) => {
                env.insert(binding.env_var_name.clone(), value);
            }
            None => {
                return Ok(Resolution::Fail(format!(
                    "secret '{}' key '{}' not found and no default given",
                    binding.secret_ref, binding.secret_key
                )));
            }
        }
    }

    let remote = match task.spec.kind {
        crate::crd::task::TaskKind::RemoteCall => {
            match resolve_remote(task, ctx, namespace, &input).await? {
                Ok(resolved) => Some(resolved),
                Err(reason) => return Ok(Resolution::Fail(reason)),
            }
        }
        _ => None,
    };

    Ok(Resolution::Ready(ResolvedAttempt { input, env, remote }))
}

enum SourceValue {
    Ready(String),
    Wait(String),
    Fail(String),
}

async fn resolve_source(source: &InputSource, api: &Api<Task>) -> Result<SourceValue> {
    let sibling = match api.get_opt(&source.task_ref).await? {
        Some(sibling) if sibling.phase().is_terminal() => sibling,
        // Missing or still-active references resolve through the default
        // when one is given; otherwise the task waits.
        _ => {
            return Ok(match &source.default {
                Some(default) => SourceValue::Ready(default.clone()),
                None => SourceValue::Wait(format!(
                    "source task '{}' is not terminal",
                    source.task_ref
                )),
            });
        }
    };
    let phase = sibling.phase();
    let result = sibling.status.as_ref().and_then(|s| s.result.as_ref());

    let raw = match source.field {
        InputField::Output => result.map(|r| r.output.clone()).unwrap_or_default(),
        InputField::ErrorCode => result.map(|r| r.error_code.clone()).unwrap_or_default(),
        InputField::ErrorMessage => result.map(|r| r.error_message.clone()).unwrap_or_default(),
        InputField::Phase => phase.to_string(),
        InputField::All => serde_json::json!({
            "phase": phase.to_string(),
            "output": result.map(|r| r.output.as_str()).unwrap_or(""),
            "errorCode": result.map(|r| r.error_code.as_str()).unwrap_or(""),
            "errorMessage": result.map(|r| r.error_message.as_str()).unwrap_or(""),
        })
        .to_string(),
    };

    if source.field == InputField::Output
        && let Some(expr) = &source.path_expr
    {
        return Ok(match jsonpath::extract(&raw, expr) {
            Ok(extracted) => SourceValue::Ready(extracted),
            Err(e) => match &source.default {
                Some(default) => SourceValue::Ready(default.clone()),
                None => SourceValue::Fail(format!(
                    "source '{}' extraction failed: {:#}",
                    source.name, e
                )),
            },
        });
    }

    Ok(SourceValue::Ready(raw))
}

/// Dereference remote credentials and assemble the resolved call. The inner
/// `Err` carries a permanent configuration failure.
async fn resolve_remote(
    task: &Task,
    ctx: &Ctx,
    namespace: &str,
    input: &str,
) -> Result<std::result::Result<ResolvedRemoteCall, String>> {
    let Some(config) = &task.spec.remote_config else {
        return Ok(Err("remoteCall task has no remoteConfig".to_string()));
    };

    let mut headers: Vec<(String, String)> = config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(auth) = &config.auth
        && auth.auth_type != RemoteAuthType::None
    {
        let (Some(secret_ref), Some(secret_key)) = (&auth.secret_ref, &auth.secret_key) else {
            return Ok(Err("remote auth requires secretRef and secretKey".to_string()));
        };
        let Some(credential) =
            repository::secret_value(&ctx.client, namespace, secret_ref, secret_key).await?
        else {
            return Ok(Err(format!(
                "secret '{}' key '{}' not found and no default given",
                secret_ref, secret_key
            )));
        };
        if let Some(header) =
            remote::auth_header(auth.auth_type, auth.header_name.as_deref(), &credential)
        {
            headers.push(header);
        }
    }

    let server_url = if config.server_url.is_empty() {
        input.to_string()
    } else {
        config.server_url.clone()
    };

    Ok(Ok(ResolvedRemoteCall {
        server_url,
        tool_name: config.tool_name.clone(),
        arguments: config.arguments.clone(),
        headers,
        connect_timeout: config.connection_timeout_seconds.map(Duration::from_secs),
    }))
}

async fn skip_terminal(api: &Api<Task>, current: &Task, key: &str, reason: &str) -> Result<Action> {
    let mut status = current.status.clone().unwrap_or_default();
    status.phase = TaskPhase::Skipped;
    status.completion_time = Some(now_rfc3339());
    status.result = Some(TaskResult::skipped(reason));
    repository::update_task_status(api, &current.name_any(), status).await?;
    info!(task = %key, phase = %TaskPhase::Skipped, reason = %reason, "task skipped");
    Ok(Action::await_change())
}

async fn fail_terminal(api: &Api<Task>, current: &Task, key: &str, reason: String) -> Result<Action> {
    let mut status = current.status.clone().unwrap_or_default();
    status.phase = TaskPhase::Failed;
    status.completion_time = Some(now_rfc3339());
    status.result = Some(TaskResult::failure(String::new(), reason.clone()));
    repository::update_task_status(api, &current.name_any(), status).await?;
    info!(task = %key, phase = %TaskPhase::Failed, error = %reason, "task failed");
    Ok(Action::await_change())
}

/// Linear backoff after a failed attempt: `retryCount × 1 s`, capped at 30 s.
pub fn retry_backoff(retry_count: u32) -> Duration {
    Duration::from_secs(u64::from(retry_count).min(30))
}

/// Per-attempt deadline: the task's own timeout (or the process default),
/// never past the worker deadline.
pub fn attempt_deadline(spec: &TaskSpec, config: &OperatorConfig) -> Duration {
    spec.timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(config.task_timeout)
        .min(Duration::from_secs(WORKER_DEADLINE_SECS))
}

fn execution_millis(status: &crate::crd::task::TaskStatus, attempt_ms: i64) -> i64 {
    status
        .start_time
        .as_deref()
        .and_then(parse_time)
        .map(|started| (Utc::now() - started).num_milliseconds())
        .unwrap_or(attempt_ms)
}

fn object_key(task: &Task) -> String {
    format!(
        "{}/{}",
        task.namespace().unwrap_or_default(),
        task.name_any()
    )
}
