//! The Workflow reconciler: cycle validation, topological child
//! materialization, phase aggregation, DAG snapshots with bounded history,
//! and cron-driven resets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event, finalizer};
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controllers::{Ctx, now_rfc3339, parse_time};
use crate::crd::task::TaskPhase;
use crate::crd::workflow::{WorkflowPhase, WorkflowTask, WorkflowTaskStatus};
use crate::crd::{
    CONDITION_ANNOTATION, FINALIZER, LOCAL_NAME_LABEL, Task, WORKFLOW_LABEL, Workflow, child_name,
};
use crate::engine::{dag, schedule};
use crate::error::{Error, Result};
use crate::repository;

/// How often a scheduled workflow re-checks whether its next fire is due.
const CRON_POLL: Duration = Duration::from_secs(10);

/// Requeue while a blueprint reference dangles.
const TEMPLATE_REQUEUE: Duration = Duration::from_secs(30);

pub async fn reconcile(workflow: Arc<Workflow>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = workflow.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Workflow> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, workflow, |event| async {
        match event {
            Event::Apply(workflow) => apply(workflow, &api, &ctx, &namespace).await,
            Event::Cleanup(workflow) => cleanup(workflow).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

pub fn error_policy(workflow: Arc<Workflow>, error: &Error, ctx: Arc<Ctx>) -> Action {
    let key = format!(
        "{}/{}",
        workflow.namespace().unwrap_or_default(),
        workflow.name_any()
    );
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        workflow = %key,
        error = %error,
        delay_ms = delay.as_millis() as u64,
        "reconciliation error, backing off"
    );
    Action::requeue(delay)
}

/// Children carry an ownerReference and are garbage-collected by the cluster;
/// nothing else to tear down.
async fn cleanup(workflow: Arc<Workflow>) -> Result<Action> {
    info!(workflow = %workflow.name_any(), "workflow deleted, children follow via owner references");
    Ok(Action::await_change())
}

async fn apply(
    workflow: Arc<Workflow>,
    api: &Api<Workflow>,
    ctx: &Ctx,
    namespace: &str,
) -> Result<Action> {
    let name = workflow.name_any();
    let Some(current) = api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };
    let key = format!("{}/{}", namespace, name);
    let tasks_api: Api<Task> = Api::namespaced(ctx.client.clone(), namespace);

    let mut status = current.status.clone().unwrap_or_default();

    // Reject cyclic graphs before any child exists.
    let pairs: Vec<(String, Vec<String>)> = current
        .spec
        .tasks
        .iter()
        .map(|t| (t.local_name.clone(), t.dependencies.clone()))
        .collect();
    if let Err(e) = dag::chain_levels(&pairs) {
        if status.phase != WorkflowPhase::Failed {
            status.phase = WorkflowPhase::Failed;
            status.message = Some(format!("{:#}", e));
            status.completion_time = Some(now_rfc3339());
            repository::update_workflow_status(api, &name, status).await?;
            error!(workflow = %key, error = %e, "rejecting workflow graph");
        }
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    // Cron: a due fire resets a terminal run; a still-active run skips the
    // fire with a warning.
    let mut has_schedule = false;
    if let Some(expr) = &current.spec.schedule {
        has_schedule = true;
        let parsed = match schedule::parse(expr) {
            Ok(parsed) => parsed,
            Err(e) => {
                if status.phase != WorkflowPhase::Failed {
                    status.phase = WorkflowPhase::Failed;
                    status.message = Some(format!("{:#}", e));
                    status.completion_time = Some(now_rfc3339());
                    repository::update_workflow_status(api, &name, status).await?;
                    error!(workflow = %key, error = %e, "rejecting workflow schedule");
                }
                ctx.backoff.reset(&key);
                return Ok(Action::await_change());
            }
        };

        let anchor = status
            .last_run_time
            .as_deref()
            .or(status.start_time.as_deref())
            .and_then(parse_time)
            .unwrap_or_else(Utc::now);
        if let Some(fire) = schedule::next_fire(&parsed, anchor)
            && Utc::now() >= fire
        {
            if status.phase.is_terminal() {
                repository::delete_children(&tasks_api, &name).await?;
                status.task_statuses.clear();
                status.phase = WorkflowPhase::Pending;
                status.message = None;
                status.start_time = None;
                status.completion_time = None;
                status.last_run_time = Some(now_rfc3339());
                // The dag and its history survive the reset so readers keep
                // seeing the last completed run until new nodes appear.
                repository::update_workflow_status(api, &name, status).await?;
                info!(workflow = %key, fire = %fire, "scheduled fire, workflow reset");
                ctx.backoff.reset(&key);
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            warn!(workflow = %key, fire = %fire, "previous run still active, skipping scheduled fire");
        }
    }

    if current.spec.tasks.is_empty() {
        ctx.backoff.reset(&key);
        return Ok(if has_schedule {
            Action::requeue(CRON_POLL)
        } else {
            Action::await_change()
        });
    }

    if status.start_time.is_none() {
        status.start_time = Some(now_rfc3339());
    }

    // Materialize or update children in dependency order, deferring
    // startable children beyond the concurrency cap to a later pass.
    let mut by_local = index_by_local_name(repository::list_children(&tasks_api, &name).await?);

    let mut running = by_local
        .values()
        .filter(|c| c.phase() == TaskPhase::Running)
        .count() as u32;
    let cap = current.spec.concurrency.unwrap_or(0);
    let mut changed_any = false;

    let ordered = order_by_level(&current.spec.tasks, &pairs);
    for wf_task in ordered {
        let existing = by_local.get(wf_task.local_name.as_str());

        let startable = wf_task.dependencies.iter().all(|dep| {
            by_local
                .get(dep.as_str())
                .map(|c| c.phase().is_terminal())
                .unwrap_or(false)
        }) || wf_task.dependencies.is_empty();
        if existing.is_none() && cap > 0 && startable && running >= cap {
            debug!(workflow = %key, task = %wf_task.local_name, "deferring child beyond concurrency cap");
            continue;
        }

        let template_ns = wf_task
            .template_ref
            .namespace
            .as_deref()
            .unwrap_or(namespace);
        let blueprint_api: Api<Task> = Api::namespaced(ctx.client.clone(), template_ns);
        let Some(blueprint) = blueprint_api.get_opt(&wf_task.template_ref.name).await? else {
            info!(
                workflow = %key,
                template = %wf_task.template_ref.name,
                "blueprint not found, requeueing"
            );
            return Ok(Action::requeue(TEMPLATE_REQUEUE));
        };

        let desired = build_child(&current, wf_task, &blueprint, namespace)?;
        match existing {
            None => {
                repository::create_task(&tasks_api, &desired).await?;
                info!(workflow = %key, task = %wf_task.local_name, "materialized child task");
                changed_any = true;
                if startable {
                    running += 1;
                }
            }
            Some(stored) if child_needs_update(stored, &desired) => {
                // Blueprint or overlay edits propagate to the live child;
                // its status and any in-flight attempt are untouched.
                let task_name = child_name(&name, &wf_task.local_name);
                repository::replace_task(&tasks_api, &task_name, |stored| {
                    overlay_child(stored, &desired);
                })
                .await?;
                info!(workflow = %key, task = %wf_task.local_name, "updated child task from blueprint");
                changed_any = true;
            }
            Some(_) => {}
        }
    }

    if changed_any {
        by_local = index_by_local_name(repository::list_children(&tasks_api, &name).await?);
    }

    // Aggregate phase over every declared task; a not-yet-created child
    // counts as Pending.
    let phases: Vec<TaskPhase> = current
        .spec
        .tasks
        .iter()
        .map(|t| {
            by_local
                .get(t.local_name.as_str())
                .map(|c| c.phase())
                .unwrap_or_default()
        })
        .collect();
    let new_phase = aggregate_phase(&phases);

    status.task_statuses = current
        .spec
        .tasks
        .iter()
        .map(|t| {
            let child = by_local.get(t.local_name.as_str());
            let child_status = child.and_then(|c| c.status.as_ref());
            WorkflowTaskStatus {
                local_name: t.local_name.clone(),
                phase: child.map(|c| c.phase()).unwrap_or_default(),
                start_time: child_status.and_then(|s| s.start_time.clone()),
                completion_time: child_status.and_then(|s| s.completion_time.clone()),
                error_code: child_status
                    .and_then(|s| s.result.as_ref())
                    .map(|r| r.error_code.clone()),
            }
        })
        .collect();

    // Rebuild the graph snapshot once the run has nodes. The previous run's
    // snapshot stays in place until then.
    if !by_local.is_empty() {
        let started = status
            .start_time
            .as_deref()
            .and_then(parse_time)
            .unwrap_or_else(Utc::now);
        let run_id = dag::run_id(&name, &started);
        let infos = node_infos(&current.spec.tasks, &by_local);
        // The graph was validated acyclic above, so this only fails if the
        // spec changed under us; the next pass picks that up.
        if let Ok(snapshot) = dag::build_snapshot(run_id, Utc::now(), new_phase, &infos) {
            let unchanged = status
                .dag
                .as_ref()
                .map(|existing| dag::snapshots_equivalent(existing, &snapshot))
                .unwrap_or(false);
            if !unchanged {
                status.dag = Some(snapshot);
            }
        }
    }

    let previous_phase = status.phase;
    status.phase = new_phase;
    if new_phase.is_terminal() {
        if status.completion_time.is_none() {
            status.completion_time = Some(now_rfc3339());
        }
        if let Some(snapshot) = &status.dag {
            let mut frozen = snapshot.clone();
            frozen.workflow_phase = new_phase;
            status.record_run(frozen);
        }
    }

    if previous_phase != new_phase {
        info!(workflow = %key, from = %previous_phase, to = %new_phase, "phase transition");
    }

    if Some(&status) != current.status.as_ref() {
        repository::update_workflow_status(api, &name, status).await?;
    }
    ctx.backoff.reset(&key);

    Ok(if has_schedule {
        Action::requeue(CRON_POLL)
    } else if new_phase.is_terminal() {
        Action::await_change()
    } else {
        Action::requeue(ctx.config.reconcile_interval)
    })
}

/// Derived workflow phase, re-computed on every pass:
/// failed-and-settled beats all, then all-succeeded-or-skipped, then any
/// running, otherwise pending.
pub fn aggregate_phase(phases: &[TaskPhase]) -> WorkflowPhase {
    if phases.is_empty() {
        return WorkflowPhase::Pending;
    }
    let any_active = phases
        .iter()
        .any(|p| matches!(p, TaskPhase::Pending | TaskPhase::Running));
    if phases.contains(&TaskPhase::Failed) && !any_active {
        return WorkflowPhase::Failed;
    }
    if phases
        .iter()
        .all(|p| matches!(p, TaskPhase::Succeeded | TaskPhase::Skipped))
    {
        return WorkflowPhase::Succeeded;
    }
    if phases.contains(&TaskPhase::Running) {
        return WorkflowPhase::Running;
    }
    WorkflowPhase::Pending
}

/// Materialize a child Task from its blueprint: copy the spec, then overlay
/// the workflow-task's wiring with every local name rewritten to its
/// prefixed child name, and stamp ownership metadata.
pub fn build_child(
    workflow: &Workflow,
    wf_task: &WorkflowTask,
    blueprint: &Task,
    namespace: &str,
) -> Result<Task> {
    let workflow_name = workflow
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let mut spec = blueprint.spec.clone();
    spec.dependencies = wf_task
        .dependencies
        .iter()
        .map(|dep| child_name(workflow_name, dep))
        .collect();
    if !wf_task.input_sources.is_empty() {
        spec.input_sources = wf_task
            .input_sources
            .iter()
            .cloned()
            .map(|mut source| {
                source.task_ref = child_name(workflow_name, &source.task_ref);
                source
            })
            .collect();
    }
    if wf_task.input_template.is_some() {
        spec.input_template = wf_task.input_template.clone();
    }
    if spec.timeout_seconds.is_none() {
        spec.timeout_seconds = workflow.spec.timeout_seconds;
    }
    if let Some(policy) = &workflow.spec.retry_policy {
        if let Some(limit) = policy.retry_limit {
            spec.retry_limit = limit;
        }
        if let Some(fail_fast) = policy.fail_fast {
            spec.fail_fast = fail_fast;
        }
    }
    for (key, value) in &workflow.spec.environment {
        spec.environment.insert(key.clone(), value.clone());
    }
    // Children run under the workflow's lifecycle, never their own cron.
    spec.schedule = None;

    let mut labels = BTreeMap::new();
    labels.insert(WORKFLOW_LABEL.to_string(), workflow_name.to_string());
    labels.insert(LOCAL_NAME_LABEL.to_string(), wf_task.local_name.clone());

    let mut annotations = BTreeMap::new();
    if let Some(condition) = &wf_task.condition {
        let mut rewritten = condition.clone();
        rewritten.dependent_task = child_name(workflow_name, &rewritten.dependent_task);
        annotations.insert(
            CONDITION_ANNOTATION.to_string(),
            serde_json::to_string(&rewritten)?,
        );
    }

    let mut child = Task::new(&child_name(workflow_name, &wf_task.local_name), spec);
    child.metadata = ObjectMeta {
        name: child.metadata.name.clone(),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations: if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        },
        owner_references: Some(vec![owner_reference(workflow)?]),
        ..ObjectMeta::default()
    };
    Ok(child)
}

/// True when a stored child has drifted from what the blueprint and overlay
/// now produce, in the fields the workflow owns: the spec and the condition
/// annotation.
pub fn child_needs_update(stored: &Task, desired: &Task) -> bool {
    stored.spec != desired.spec || condition_annotation(stored) != condition_annotation(desired)
}

/// Copy the workflow-owned fields of `desired` onto a stored child, leaving
/// everything else (status, user annotations, resourceVersion) in place.
fn overlay_child(stored: &mut Task, desired: &Task) {
    stored.spec = desired.spec.clone();
    if let Some(labels) = &desired.metadata.labels {
        let stored_labels = stored.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            stored_labels.insert(key.clone(), value.clone());
        }
    }
    match condition_annotation(desired) {
        Some(raw) => {
            stored
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(CONDITION_ANNOTATION.to_string(), raw.clone());
        }
        None => {
            if let Some(annotations) = stored.metadata.annotations.as_mut() {
                annotations.remove(CONDITION_ANNOTATION);
            }
        }
    }
}

fn condition_annotation(task: &Task) -> Option<&String> {
    task.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(CONDITION_ANNOTATION))
}

fn owner_reference(workflow: &Workflow) -> Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: Workflow::api_version(&()).to_string(),
        kind: Workflow::kind(&()).to_string(),
        name: workflow
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: workflow
            .metadata
            .uid
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..OwnerReference::default()
    })
}

fn index_by_local_name(children: Vec<Task>) -> HashMap<String, Task> {
    children
        .into_iter()
        .filter_map(|task| {
            task.labels()
                .get(LOCAL_NAME_LABEL)
                .cloned()
                .map(|local| (local, task))
        })
        .collect()
}

/// Spec tasks sorted by their longest-chain level, stable within a level.
fn order_by_level<'a>(
    tasks: &'a [WorkflowTask],
    pairs: &[(String, Vec<String>)],
) -> Vec<&'a WorkflowTask> {
    let levels = dag::chain_levels(pairs).unwrap_or_default();
    let mut ordered: Vec<&WorkflowTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| levels.get(&t.local_name).copied().unwrap_or(0));
    ordered
}

fn node_infos(tasks: &[WorkflowTask], by_local: &HashMap<String, Task>) -> Vec<dag::NodeInfo> {
    tasks
        .iter()
        .map(|wf_task| {
            let child = by_local.get(wf_task.local_name.as_str());
            let child_status = child.and_then(|c| c.status.as_ref());
            let result = child_status.and_then(|s| s.result.as_ref());
            dag::NodeInfo {
                id: wf_task.local_name.clone(),
                kind: child
                    .map(|c| c.spec.kind.to_string())
                    .unwrap_or_default(),
                phase: child.map(|c| c.phase()).unwrap_or_default(),
                start_time: child_status.and_then(|s| s.start_time.clone()),
                completion_time: child_status.and_then(|s| s.completion_time.clone()),
                output: result.map(|r| r.output.clone()).unwrap_or_default(),
                error_code: result.map(|r| r.error_code.clone()).unwrap_or_default(),
                retries: child_status.map(|s| s.retry_count).unwrap_or(0),
                template: wf_task.template_ref.name.clone(),
                dependencies: wf_task.dependencies.clone(),
                condition: wf_task.condition.clone(),
            }
        })
        .collect()
}
