use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::error;

/// Reference to the piece of work dispatched by each task: the worker wrapper
/// resolves `object` and invokes `method` on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCallable {
    pub object: String,
    pub method: String,
}

/// Immutable description of one task array: how many tasks to run, how wide
/// each task is and how constrained the whole array is.
///
/// Validated once at construction time; the execution engine never defaults
/// or discovers fields on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskArraySpec {
    /// Job name used for scheduler submissions.
    pub name: String,
    /// Number of tasks in the array.
    pub task_count: u32,
    /// Cores used by a single task.
    pub cores_per_task: u32,
    /// Cores available on one node of the target site.
    pub cores_per_node: u32,
    /// Maximum number of concurrently submitted tasks.
    pub max_concurrent: u32,
    /// Time budget of a single task; exceeding it aborts the whole session.
    pub task_time: Duration,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Maximum number of resubmissions of a single task. `None` retries
    /// indefinitely.
    pub retry_limit: Option<u32>,
    /// Worker wrapper executable run by every task.
    pub runner: PathBuf,
    pub callable: TaskCallable,
    /// KEY=VALUE pairs exported into every task's environment.
    pub env: Vec<(String, String)>,
    /// Working directory holding submission scripts and task output.
    pub workdir: PathBuf,
}

impl TaskArraySpec {
    pub fn validate(&self) -> crate::Result<()> {
        if self.task_count < 1 {
            return error("Task count must be at least 1".to_string());
        }
        if self.cores_per_task < 1 {
            return error("Cores per task must be at least 1".to_string());
        }
        if self.cores_per_node < 1 {
            return error("Cores per node must be at least 1".to_string());
        }
        if self.max_concurrent < 1 {
            return error("Maximum concurrency must be at least 1".to_string());
        }
        if self.task_time.is_zero() {
            return error("Task time budget must be nonzero".to_string());
        }
        if self.poll_interval.is_zero() {
            return error("Poll interval must be nonzero".to_string());
        }
        if self.runner.as_os_str().is_empty() {
            return error("Runner executable must be set".to_string());
        }
        for field in [&self.callable.object, &self.callable.method] {
            if field.is_empty() || field.contains(char::is_whitespace) {
                return error(format!("Invalid callable reference `{field}`"));
            }
        }
        for (key, value) in &self.env {
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return error(format!("Invalid environment variable name `{key}`"));
            }
            if value.contains(['"', '\n']) {
                return error(format!("Invalid value of environment variable {key}"));
            }
        }
        Ok(())
    }
}
