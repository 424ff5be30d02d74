use std::time::Duration;

use anyhow::{Context as _, Result};

/// Process-level tunables, read from the environment once at startup.
#[derive(Debug, Clone, Copy)]
pub struct OperatorConfig {
    /// Default requeue period for polled conditions (`RECONCILE_INTERVAL`,
    /// seconds).
    pub reconcile_interval: Duration,
    /// Default per-attempt executor deadline when `spec.timeoutSeconds` is
    /// absent (`TASK_TIMEOUT`, seconds).
    pub task_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            task_timeout: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            reconcile_interval: read_secs("RECONCILE_INTERVAL", 5)?,
            task_timeout: read_secs("TASK_TIMEOUT", 5)?,
        })
    }
}

fn read_secs(var: &str, default: u64) -> Result<Duration> {
    match std::env::var(var) {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer number of seconds, got '{}'", var, raw))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
