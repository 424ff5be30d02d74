//! Controller wiring. Two reconcilers share one client and one process:
//! Tasks on four workers, Workflows on two. kube-runtime's controller gives
//! us per-key single-flight dispatch, event coalescing, and time-deferred
//! requeues; the pieces owned here are the reconcile functions themselves
//! and the per-key error backoff.

pub mod task;
pub mod workflow;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, error, info};

use crate::cli::config::OperatorConfig;
use crate::crd::{Task, Workflow};
use crate::error::Result;

pub const TASK_WORKERS: u16 = 4;
pub const WORKFLOW_WORKERS: u16 = 2;

/// Reconciliations never outlive this, regardless of the task's own timeout.
pub const WORKER_DEADLINE_SECS: u64 = 300;

/// Shared state handed to every reconciliation.
pub struct Ctx {
    pub client: Client,
    pub config: OperatorConfig,
    pub backoff: ErrorBackoff,
}

/// Per-key retry delays for reconciler errors: exponential from 5 ms,
/// doubling per consecutive failure, capped at 1000 s, reset on the next
/// clean pass.
pub struct ErrorBackoff {
    attempts: Mutex<HashMap<String, u32>>,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl ErrorBackoff {
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock().expect("backoff lock poisoned");
        let entry = attempts.entry(key.to_string()).or_insert(0);
        let delay = error_backoff_delay(*entry);
        *entry = entry.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.attempts.lock().expect("backoff lock poisoned").remove(key);
    }
}

/// Delay before the `attempt`-th retry (zero-based): `5ms * 2^attempt`,
/// capped at 1000 s.
pub fn error_backoff_delay(attempt: u32) -> Duration {
    const CAP: Duration = Duration::from_secs(1000);
    let millis = 5u128.saturating_mul(1u128 << attempt.min(40));
    if millis >= CAP.as_millis() {
        CAP
    } else {
        Duration::from_millis(millis as u64)
    }
}

/// Run both controllers until shutdown. Blocks for the life of the process.
pub async fn run(client: Client, config: OperatorConfig) -> Result<()> {
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        config,
        backoff: ErrorBackoff::default(),
    });

    let tasks: Api<Task> = Api::all(client.clone());
    let workflows: Api<Workflow> = Api::all(client.clone());

    info!(
        task_workers = TASK_WORKERS,
        workflow_workers = WORKFLOW_WORKERS,
        "starting reconcilers"
    );

    let task_controller = Controller::new(tasks.clone(), watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(TASK_WORKERS))
        .shutdown_on_signal()
        .run(task::reconcile, task::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((key, _)) => debug!(task = %key.name, "reconciled"),
                Err(e) => error!(error = %e, "task reconciliation failed"),
            }
        });

    let workflow_controller = Controller::new(workflows, watcher::Config::default())
        .owns(tasks, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(WORKFLOW_WORKERS))
        .shutdown_on_signal()
        .run(workflow::reconcile, workflow::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((key, _)) => debug!(workflow = %key.name, "reconciled"),
                Err(e) => error!(error = %e, "workflow reconciliation failed"),
            }
        });

    tokio::join!(task_controller, workflow_controller);
    info!("reconcilers terminated");
    Ok(())
}

/// RFC3339 UTC timestamp used across all status fields.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse a status timestamp back into a concrete time.
pub fn parse_time(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}
