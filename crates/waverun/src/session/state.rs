use serde::{Deserialize, Serialize};

use crate::scheduler::JobId;

/// Submission record of one task index.
///
/// The record list of a session is ordered by `task_index` and a record is
/// never removed or reinserted at a different position: when a task fails,
/// its `job_id` is overwritten in place and `retries` incremented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_index: u32,
    pub job_id: JobId,
    pub retries: u32,
    pub completed: bool,
}

impl JobRecord {
    pub fn new(task_index: u32, job_id: JobId) -> JobRecord {
        JobRecord {
            task_index,
            job_id,
            retries: 0,
            completed: false,
        }
    }

    /// Replaces the external identity of this record after a resubmission.
    pub fn replace_job(&mut self, job_id: JobId) {
        self.job_id = job_id;
        self.retries += 1;
    }
}

/// Aggregate outcome of one successfully completed array execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub task_count: u32,
    pub resubmissions: u64,
    pub polls: u64,
}
