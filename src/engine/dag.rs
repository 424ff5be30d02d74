use std::collections::{HashMap, HashSet};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

use crate::crd::task::TaskPhase;
use crate::crd::workflow::{
    ConditionWhen, DagEdge, DagEdgeType, DagMetadata, DagNode, DagSnapshot, TaskCondition,
    WorkflowPhase,
};

const LANE_SPACING_X: i32 = 220;
const LEVEL_SPACING_Y: i32 = 120;
const LANE_OFFSET_X: i32 = 100;
const LEVEL_OFFSET_Y: i32 = 80;
const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Everything the snapshot builder needs to know about one graph node.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub id: String,
    pub kind: String,
    pub phase: TaskPhase,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
    pub output: String,
    pub error_code: String,
    pub retries: u32,
    pub template: String,
    pub dependencies: Vec<String>,
    pub condition: Option<TaskCondition>,
}

/// Longest-dependency-chain depth for every task, computed with Kahn's
/// algorithm. A task with no dependencies sits at level 0; otherwise its
/// level is one past its deepest dependency. Fails when the graph has a
/// cycle or references an unknown task.
pub fn chain_levels(tasks: &[(String, Vec<String>)]) -> Result<HashMap<String, usize>> {
    let names: HashSet<&str> = tasks.iter().map(|(name, _)| name.as_str()).collect();

    for (name, deps) in tasks {
        for dep in deps {
            if !names.contains(dep.as_str()) {
                bail!("task '{}' depends on '{}', which does not exist", name, dep);
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, deps) in tasks {
        in_degree.entry(name.as_str()).or_insert(0);
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
            *in_degree.entry(name.as_str()).or_insert(0) += 1;
        }
    }

    let mut levels: HashMap<String, usize> = HashMap::new();
    let mut remaining: HashSet<&str> = names.clone();
    let mut level = 0usize;

    loop {
        // Keep spec order within a wave so lane assignment is deterministic.
        let ready: Vec<&str> = tasks
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| {
                remaining.contains(name) && in_degree.get(name).copied().unwrap_or(0) == 0
            })
            .collect();

        if ready.is_empty() {
            if remaining.is_empty() {
                break;
            }
            let mut stuck: Vec<&str> = remaining.into_iter().collect();
            stuck.sort_unstable();
            bail!("cycle detected in task dependencies: {:?}", stuck);
        }

        for name in &ready {
            remaining.remove(name);
            levels.insert((*name).to_string(), level);
            if let Some(deps) = dependents.get(name) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
        }

        level += 1;
    }

    Ok(levels)
}

/// Deterministic run identifier derived from the run's start time.
pub fn run_id(workflow: &str, started: &DateTime<Utc>) -> String {
    format!("{}-{}", workflow, started.format("%Y%m%d-%H%M%S"))
}

/// Rebuild the full graph snapshot: one node per task with a layered layout,
/// one edge per dependency plus one per condition, and aggregate counters.
pub fn build_snapshot(
    run_id: String,
    timestamp: DateTime<Utc>,
    workflow_phase: WorkflowPhase,
    nodes: &[NodeInfo],
) -> Result<DagSnapshot> {
    let pairs: Vec<(String, Vec<String>)> = nodes
        .iter()
        .map(|n| (n.id.clone(), n.dependencies.clone()))
        .collect();
    let levels = chain_levels(&pairs)?;

    let mut lane_within_level: HashMap<usize, i32> = HashMap::new();
    let mut dag_nodes = Vec::with_capacity(nodes.len());
    let mut edges = Vec::new();
    let mut metadata = DagMetadata::default();

    for info in nodes {
        let level = levels.get(&info.id).copied().unwrap_or(0);
        let lane = lane_within_level.entry(level).or_insert(0);
        let x = *lane * LANE_SPACING_X + LANE_OFFSET_X;
        let y = level as i32 * LEVEL_SPACING_Y + LEVEL_OFFSET_Y;
        *lane += 1;

        match info.phase {
            TaskPhase::Succeeded => metadata.succeeded += 1,
            TaskPhase::Failed => metadata.failed += 1,
            TaskPhase::Running => metadata.running += 1,
            TaskPhase::Pending => metadata.pending += 1,
            TaskPhase::Skipped => metadata.skipped += 1,
        }
        metadata.total += 1;

        dag_nodes.push(DagNode {
            id: info.id.clone(),
            kind: info.kind.clone(),
            phase: info.phase,
            start_time: info.start_time.clone(),
            end_time: info.completion_time.clone(),
            duration: duration_between(&info.start_time, &info.completion_time),
            output_preview: preview(&info.output),
            error_code: info.error_code.clone(),
            x,
            y,
            retries: info.retries,
            template: info.template.clone(),
        });

        for dep in &info.dependencies {
            edges.push(DagEdge {
                source: dep.clone(),
                target: info.id.clone(),
                edge_type: DagEdgeType::Dependency,
                label: "requires".to_string(),
            });
        }

        if let Some(condition) = &info.condition {
            let (edge_type, label) = match condition.when {
                ConditionWhen::Success => (DagEdgeType::Success, "on success"),
                ConditionWhen::Failure => (DagEdgeType::Failure, "on failure"),
                ConditionWhen::Always | ConditionWhen::Completed => (DagEdgeType::Always, "always"),
            };
            edges.push(DagEdge {
                source: condition.dependent_task.clone(),
                target: info.id.clone(),
                edge_type,
                label: label.to_string(),
            });
        }
    }

    Ok(DagSnapshot {
        run_id,
        timestamp: timestamp.to_rfc3339(),
        workflow_phase,
        nodes: dag_nodes,
        edges,
        metadata,
    })
}

/// True when two snapshots differ only by their capture timestamp. Used to
/// avoid rewriting an unchanged status on every pass.
pub fn snapshots_equivalent(a: &DagSnapshot, b: &DagSnapshot) -> bool {
    a.run_id == b.run_id
        && a.workflow_phase == b.workflow_phase
        && a.nodes == b.nodes
        && a.edges == b.edges
        && a.metadata == b.metadata
}

/// Human-readable duration between two RFC3339 timestamps, empty when either
/// end is missing.
fn duration_between(start: &Option<String>, end: &Option<String>) -> String {
    let (Some(start), Some(end)) = (start, end) else {
        return String::new();
    };
    let (Ok(start), Ok(end)) = (
        DateTime::parse_from_rfc3339(start),
        DateTime::parse_from_rfc3339(end),
    ) else {
        return String::new();
    };
    human_duration((end - start).num_milliseconds())
}

pub fn human_duration(millis: i64) -> String {
    if millis < 0 {
        return String::new();
    }
    let secs = millis / 1000;
    if secs < 1 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn preview(output: &str) -> String {
    if output.chars().count() <= OUTPUT_PREVIEW_CHARS {
        return output.to_string();
    }
    let cut: String = output.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
