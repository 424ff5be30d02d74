//! Tests for the pure decision helpers inside the controllers: phase
//! aggregation, backoff computation, deadlines, and child materialization.

use std::time::Duration;

use mcall::cli::config::OperatorConfig;
use mcall::controllers::error_backoff_delay;
use mcall::controllers::task::{attempt_deadline, retry_backoff};
use mcall::controllers::workflow::{aggregate_phase, build_child, child_needs_update};
use mcall::crd::task::{TaskKind, TaskSpec};
use mcall::crd::workflow::{
    ConditionWhen, RetryPolicy, TaskCondition, TemplateRef, Workflow, WorkflowPhase, WorkflowSpec,
    WorkflowTask,
};
use mcall::crd::{CONDITION_ANNOTATION, LOCAL_NAME_LABEL, Task, WORKFLOW_LABEL};

use mcall::crd::task::TaskPhase::{Failed, Pending, Running, Skipped, Succeeded};

// --- phase aggregation ---

#[test]
fn empty_graph_is_pending() {
    assert_eq!(aggregate_phase(&[]), WorkflowPhase::Pending);
}

#[test]
fn all_succeeded_or_skipped_is_succeeded() {
    assert_eq!(aggregate_phase(&[Succeeded, Succeeded]), WorkflowPhase::Succeeded);
    assert_eq!(aggregate_phase(&[Succeeded, Skipped]), WorkflowPhase::Succeeded);
}

#[test]
fn settled_failure_is_failed() {
    assert_eq!(aggregate_phase(&[Succeeded, Failed]), WorkflowPhase::Failed);
    assert_eq!(aggregate_phase(&[Failed, Skipped]), WorkflowPhase::Failed);
}

#[test]
fn failure_with_active_children_is_not_yet_failed() {
    assert_eq!(aggregate_phase(&[Failed, Running]), WorkflowPhase::Running);
    assert_eq!(aggregate_phase(&[Failed, Pending]), WorkflowPhase::Pending);
}

#[test]
fn any_running_is_running() {
    assert_eq!(aggregate_phase(&[Running, Pending]), WorkflowPhase::Running);
    assert_eq!(aggregate_phase(&[Succeeded, Running]), WorkflowPhase::Running);
}

#[test]
fn pending_otherwise() {
    assert_eq!(aggregate_phase(&[Pending, Pending]), WorkflowPhase::Pending);
    assert_eq!(aggregate_phase(&[Succeeded, Pending]), WorkflowPhase::Pending);
}

// --- backoff and deadlines ---

#[test]
fn retry_backoff_is_linear_and_capped() {
    assert_eq!(retry_backoff(1), Duration::from_secs(1));
    assert_eq!(retry_backoff(2), Duration::from_secs(2));
    assert_eq!(retry_backoff(30), Duration::from_secs(30));
    assert_eq!(retry_backoff(45), Duration::from_secs(30));
}

#[test]
fn error_backoff_doubles_from_5ms_and_caps() {
    assert_eq!(error_backoff_delay(0), Duration::from_millis(5));
    assert_eq!(error_backoff_delay(1), Duration::from_millis(10));
    assert_eq!(error_backoff_delay(4), Duration::from_millis(80));
    assert_eq!(error_backoff_delay(30), Duration::from_secs(1000));
    assert_eq!(error_backoff_delay(u32::MAX), Duration::from_secs(1000));
}

#[test]
fn attempt_deadline_prefers_the_spec_then_the_process_default() {
    let config = OperatorConfig::default();
    let mut spec = task_spec("true");
    assert_eq!(attempt_deadline(&spec, &config), Duration::from_secs(5));

    spec.timeout_seconds = Some(42);
    assert_eq!(attempt_deadline(&spec, &config), Duration::from_secs(42));

    // never past the worker deadline
    spec.timeout_seconds = Some(86_400);
    assert_eq!(attempt_deadline(&spec, &config), Duration::from_secs(300));
}

// --- child materialization ---

fn task_spec(input: &str) -> TaskSpec {
    TaskSpec {
        kind: TaskKind::Command,
        input: input.to_string(),
        timeout_seconds: None,
        retry_limit: 0,
        schedule: None,
        dependencies: vec![],
        environment: Default::default(),
        secret_bindings: vec![],
        validation: None,
        input_sources: vec![],
        input_template: None,
        remote_config: None,
        fail_fast: false,
    }
}

fn workflow() -> Workflow {
    let mut wf = Workflow::new(
        "demo",
        WorkflowSpec {
            tasks: vec![],
            schedule: None,
            concurrency: None,
            timeout_seconds: Some(30),
            retry_policy: Some(RetryPolicy {
                retry_limit: Some(2),
                fail_fast: Some(true),
            }),
            environment: [("STAGE".to_string(), "prod".to_string())].into(),
            resources: None,
        },
    );
    wf.metadata.uid = Some("uid-123".to_string());
    wf
}

fn wf_task() -> WorkflowTask {
    WorkflowTask {
        local_name: "use".to_string(),
        template_ref: TemplateRef {
            name: "echo-status".to_string(),
            namespace: None,
        },
        dependencies: vec!["api".to_string()],
        condition: Some(TaskCondition {
            dependent_task: "api".to_string(),
            when: ConditionWhen::Success,
            field_equals: None,
            output_contains: None,
        }),
        input_sources: vec![mcall::crd::task::InputSource {
            name: "S".to_string(),
            task_ref: "api".to_string(),
            field: Default::default(),
            path_expr: Some("$.status".to_string()),
            default: None,
        }],
        input_template: Some("echo status=${S}".to_string()),
    }
}

#[test]
fn child_rewrites_every_local_reference() {
    let mut blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    blueprint.spec.schedule = Some("* * * * *".to_string());

    let child = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();

    assert_eq!(child.metadata.name.as_deref(), Some("demo-use"));
    assert_eq!(child.spec.dependencies, vec!["demo-api"]);
    assert_eq!(child.spec.input_sources[0].task_ref, "demo-api");
    assert_eq!(child.spec.input_template.as_deref(), Some("echo status=${S}"));

    // workflow-only semantics ride on an annotation, not the spec
    let condition: TaskCondition = serde_json::from_str(
        child.metadata.annotations.as_ref().unwrap()[CONDITION_ANNOTATION].as_str(),
    )
    .unwrap();
    assert_eq!(condition.dependent_task, "demo-api");

    // children never inherit a cron of their own
    assert_eq!(child.spec.schedule, None);
}

#[test]
fn child_inherits_workflow_defaults_and_ownership() {
    let blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    let child = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();

    assert_eq!(child.spec.timeout_seconds, Some(30));
    assert_eq!(child.spec.retry_limit, 2);
    assert!(child.spec.fail_fast);
    assert_eq!(child.spec.environment["STAGE"], "prod");

    let labels = child.metadata.labels.as_ref().unwrap();
    assert_eq!(labels[WORKFLOW_LABEL], "demo");
    assert_eq!(labels[LOCAL_NAME_LABEL], "use");

    let owner = &child.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.kind, "Workflow");
    assert_eq!(owner.name, "demo");
    assert_eq!(owner.uid, "uid-123");
    assert_eq!(owner.controller, Some(true));
}

#[test]
fn blueprint_timeout_wins_over_workflow_default() {
    let mut blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    blueprint.spec.timeout_seconds = Some(7);
    let child = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();
    assert_eq!(child.spec.timeout_seconds, Some(7));
}

#[test]
fn unchanged_child_needs_no_update() {
    let blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    let first = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();
    let second = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();
    assert!(!child_needs_update(&first, &second));
}

#[test]
fn blueprint_edit_marks_the_child_for_update() {
    let blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    let stored = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();

    let mut edited = blueprint.clone();
    edited.spec.input = "echo replacement".to_string();
    let desired = build_child(&workflow(), &wf_task(), &edited, "default").unwrap();
    assert!(child_needs_update(&stored, &desired));
}

#[test]
fn condition_edit_marks_the_child_for_update() {
    let blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    let stored = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();

    let mut task = wf_task();
    task.condition.as_mut().unwrap().when = ConditionWhen::Always;
    let desired = build_child(&workflow(), &task, &blueprint, "default").unwrap();
    assert!(child_needs_update(&stored, &desired));
}

#[test]
fn overlay_edit_marks_the_child_for_update() {
    let blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    let stored = build_child(&workflow(), &wf_task(), &blueprint, "default").unwrap();

    let mut wf = workflow();
    wf.spec.retry_policy.as_mut().unwrap().retry_limit = Some(5);
    let desired = build_child(&wf, &wf_task(), &blueprint, "default").unwrap();
    assert!(child_needs_update(&stored, &desired));
}

#[test]
fn blueprint_sources_survive_when_the_workflow_task_has_none() {
    let mut blueprint = Task::new("echo-status", task_spec("echo placeholder"));
    blueprint.spec.input_sources = vec![mcall::crd::task::InputSource {
        name: "RAW".to_string(),
        task_ref: "standalone".to_string(),
        field: Default::default(),
        path_expr: None,
        default: None,
    }];
    let mut task = wf_task();
    task.input_sources.clear();

    let child = build_child(&workflow(), &task, &blueprint, "default").unwrap();
    assert_eq!(child.spec.input_sources[0].task_ref, "standalone");
}
