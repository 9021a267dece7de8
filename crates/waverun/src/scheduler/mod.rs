//! Boundary towards the external batch scheduler. The orchestrator only ever
//! talks to a [`SchedulerClient`]; each site is described by a data-only
//! [`SiteProfile`](crate::profile::SiteProfile).

pub mod common;
pub mod slurm;

use std::future::Future;
use std::pin::Pin;

use crate::Map;
use crate::plan::{IndexRange, SubmissionPlan};
use crate::session::state::JobRecord;
use crate::spec::TaskArraySpec;

pub type ClientResult<T> = anyhow::Result<T>;

/// Scheduler-assigned handle of one submitted task.
pub type JobId = String;

/// State of one task as reported by the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued or still running.
    Pending,
    Completed,
    /// Worker-reported failure; eligible for resubmission.
    Failed,
    /// The node running the task failed; eligible for resubmission.
    NodeFailure,
    /// The task exceeded its time budget; fatal for the whole session.
    TimedOut,
}

/// Per-job query results. An `Err` entry means the state of that job could
/// not be determined this tick and should be re-queried on the next one.
pub type TaskStateMap = Map<JobId, ClientResult<TaskState>>;

/// Client of one batch scheduler.
///
/// Every operation spawns the scheduler's CLI; submissions are never retried
/// by the client itself, only by the session's resubmission pass.
pub trait SchedulerClient {
    /// Submit one scheduler-native job array covering `range`. Returns one
    /// external job id per task index in the range.
    fn submit_array(
        &mut self,
        spec: &TaskArraySpec,
        plan: &SubmissionPlan,
        range: IndexRange,
    ) -> Pin<Box<dyn Future<Output = ClientResult<Map<u32, JobId>>>>>;

    /// Submit a single replacement job for `task_index`, exporting the index
    /// so the worker process can recover its identity.
    fn resubmit_task(
        &mut self,
        spec: &TaskArraySpec,
        plan: &SubmissionPlan,
        task_index: u32,
    ) -> Pin<Box<dyn Future<Output = ClientResult<JobId>>>>;

    /// Query the current state of the given records. Read-only and safe to
    /// call repeatedly; must tolerate identifiers that have aged out of the
    /// scheduler's history.
    fn query_states(
        &self,
        records: &[&JobRecord],
    ) -> Pin<Box<dyn Future<Output = ClientResult<TaskStateMap>>>>;
}
