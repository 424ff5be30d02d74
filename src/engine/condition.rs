use crate::crd::task::{TaskPhase, TaskResult};
use crate::crd::workflow::{ConditionField, ConditionWhen, TaskCondition};

/// Outcome of evaluating a skip condition against the dependent's terminal
/// state. When `proceed` is false the reason is surfaced on the skipped
/// task's result.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionVerdict {
    pub proceed: bool,
    pub reason: String,
}

impl ConditionVerdict {
    fn pass() -> Self {
        Self {
            proceed: true,
            reason: String::new(),
        }
    }

    fn skip(reason: String) -> Self {
        Self {
            proceed: false,
            reason,
        }
    }
}

/// Evaluate a condition against the dependent task's observed phase and
/// result. All present predicates must hold for the task to proceed.
pub fn evaluate(
    condition: &TaskCondition,
    dependent_phase: TaskPhase,
    dependent_result: Option<&TaskResult>,
) -> ConditionVerdict {
    let phase_ok = match condition.when {
        ConditionWhen::Success => dependent_phase == TaskPhase::Succeeded,
        ConditionWhen::Failure => dependent_phase == TaskPhase::Failed,
        ConditionWhen::Always | ConditionWhen::Completed => {
            matches!(dependent_phase, TaskPhase::Succeeded | TaskPhase::Failed)
        }
    };
    if !phase_ok {
        return ConditionVerdict::skip(format!(
            "{} is {}, condition requires {}",
            condition.dependent_task, dependent_phase, condition.when
        ));
    }

    if let Some(expectation) = &condition.field_equals {
        let actual = match expectation.field {
            ConditionField::ErrorCode => dependent_result
                .map(|r| r.error_code.clone())
                .unwrap_or_default(),
            ConditionField::Phase => dependent_phase.to_string(),
        };
        if actual != expectation.value {
            return ConditionVerdict::skip(format!(
                "{} field mismatch: got '{}', condition requires '{}'",
                condition.dependent_task, actual, expectation.value
            ));
        }
    }

    if let Some(needle) = &condition.output_contains {
        let output = dependent_result.map(|r| r.output.as_str()).unwrap_or("");
        if !output.contains(needle.as_str()) {
            return ConditionVerdict::skip(format!(
                "{} output does not contain '{}'",
                condition.dependent_task, needle
            ));
        }
    }

    ConditionVerdict::pass()
}
