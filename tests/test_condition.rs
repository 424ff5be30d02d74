//! Tests for the skip-condition engine.

use mcall::crd::task::{TaskPhase, TaskResult};
use mcall::crd::workflow::{ConditionField, ConditionWhen, FieldEquals, TaskCondition};
use mcall::engine::condition::evaluate;

fn condition(when: ConditionWhen) -> TaskCondition {
    TaskCondition {
        dependent_task: "hc".to_string(),
        when,
        field_equals: None,
        output_contains: None,
    }
}

fn success_result() -> TaskResult {
    TaskResult::success("OK\n".to_string())
}

// --- `when` matrix ---

#[test]
fn success_proceeds_on_succeeded() {
    let result = success_result();
    let verdict = evaluate(&condition(ConditionWhen::Success), TaskPhase::Succeeded, Some(&result));
    assert!(verdict.proceed);
}

#[test]
fn success_skips_on_failed() {
    let verdict = evaluate(&condition(ConditionWhen::Success), TaskPhase::Failed, None);
    assert!(!verdict.proceed);
    assert!(verdict.reason.contains("requires success"), "got: {}", verdict.reason);
}

#[test]
fn success_skips_on_skipped_dependent() {
    let verdict = evaluate(&condition(ConditionWhen::Success), TaskPhase::Skipped, None);
    assert!(!verdict.proceed);
}

#[test]
fn failure_proceeds_on_failed() {
    let verdict = evaluate(&condition(ConditionWhen::Failure), TaskPhase::Failed, None);
    assert!(verdict.proceed);
}

#[test]
fn failure_skips_on_succeeded() {
    let result = success_result();
    let verdict = evaluate(&condition(ConditionWhen::Failure), TaskPhase::Succeeded, Some(&result));
    assert!(!verdict.proceed);
}

#[test]
fn always_proceeds_on_either_outcome() {
    for phase in [TaskPhase::Succeeded, TaskPhase::Failed] {
        let verdict = evaluate(&condition(ConditionWhen::Always), phase, None);
        assert!(verdict.proceed, "expected proceed for {:?}", phase);
    }
}

#[test]
fn completed_behaves_like_always() {
    for phase in [TaskPhase::Succeeded, TaskPhase::Failed] {
        let verdict = evaluate(&condition(ConditionWhen::Completed), phase, None);
        assert!(verdict.proceed, "expected proceed for {:?}", phase);
    }
}

// --- additional predicates (AND semantics) ---

#[test]
fn field_equals_error_code_must_match() {
    let mut cond = condition(ConditionWhen::Success);
    cond.field_equals = Some(FieldEquals {
        field: ConditionField::ErrorCode,
        value: "0".to_string(),
    });
    let result = success_result();
    assert!(evaluate(&cond, TaskPhase::Succeeded, Some(&result)).proceed);

    cond.field_equals = Some(FieldEquals {
        field: ConditionField::ErrorCode,
        value: "-1".to_string(),
    });
    let verdict = evaluate(&cond, TaskPhase::Succeeded, Some(&result));
    assert!(!verdict.proceed);
    assert!(verdict.reason.contains("field mismatch"), "got: {}", verdict.reason);
}

#[test]
fn field_equals_phase_compares_display_form() {
    let mut cond = condition(ConditionWhen::Always);
    cond.field_equals = Some(FieldEquals {
        field: ConditionField::Phase,
        value: "Succeeded".to_string(),
    });
    let result = success_result();
    assert!(evaluate(&cond, TaskPhase::Succeeded, Some(&result)).proceed);
    assert!(!evaluate(&cond, TaskPhase::Failed, None).proceed);
}

#[test]
fn output_contains_must_hold() {
    let mut cond = condition(ConditionWhen::Success);
    cond.output_contains = Some("OK".to_string());
    let result = success_result();
    assert!(evaluate(&cond, TaskPhase::Succeeded, Some(&result)).proceed);

    cond.output_contains = Some("missing".to_string());
    let verdict = evaluate(&cond, TaskPhase::Succeeded, Some(&result));
    assert!(!verdict.proceed);
    assert!(verdict.reason.contains("does not contain"), "got: {}", verdict.reason);
}

#[test]
fn all_predicates_are_anded() {
    let mut cond = condition(ConditionWhen::Success);
    cond.field_equals = Some(FieldEquals {
        field: ConditionField::ErrorCode,
        value: "0".to_string(),
    });
    cond.output_contains = Some("OK".to_string());
    let result = success_result();
    assert!(evaluate(&cond, TaskPhase::Succeeded, Some(&result)).proceed);

    // Phase matches but the output predicate fails
    cond.output_contains = Some("nope".to_string());
    assert!(!evaluate(&cond, TaskPhase::Succeeded, Some(&result)).proceed);
}
