use anyhow::Context;

use crate::checkpoint::Checkpoint;
use crate::common::error::WaverunError;
use crate::plan::{self, IndexRange, SubmissionPlan};
use crate::scheduler::{SchedulerClient, TaskState, TaskStateMap};
use crate::session::state::{JobRecord, SessionReport};
use crate::spec::TaskArraySpec;

/// Owns the job records of one array execution and drives them to completion.
///
/// All phases of a tick (poll, classify, resubmit, dispatch) run sequentially
/// within this loop; nothing else mutates the record list for the lifetime of
/// the session.
pub struct ExecutionSession<'a> {
    spec: &'a TaskArraySpec,
    plan: SubmissionPlan,
    records: Vec<JobRecord>,
    resubmissions: u64,
    polls: u64,
}

impl<'a> ExecutionSession<'a> {
    pub fn new(spec: &'a TaskArraySpec, plan: SubmissionPlan) -> ExecutionSession<'a> {
        ExecutionSession {
            spec,
            plan,
            records: Vec::with_capacity(spec.task_count as usize),
            resubmissions: 0,
            polls: 0,
        }
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Runs the array to completion: checkpoint, initial wave, then a polling
    /// loop that retires completed tasks, resubmits failed ones and dispatches
    /// further waves as concurrency slots free up.
    ///
    /// Returns once every task index has completed, or with an error on the
    /// first fatal condition (rejected submission, exceeded time budget).
    pub async fn run(
        &mut self,
        client: &mut dyn SchedulerClient,
        checkpoint: &dyn Checkpoint,
    ) -> crate::Result<SessionReport> {
        checkpoint.checkpoint().context("Checkpoint failed")?;

        let initial = plan::initial_wave(self.spec);
        self.submit_wave(client, initial).await?;

        loop {
            tokio::time::sleep(self.spec.poll_interval).await;
            self.poll_once(client).await?;

            if self.all_completed() {
                log::info!(
                    "All {} tasks completed ({} resubmissions)",
                    self.spec.task_count,
                    self.resubmissions
                );
                return Ok(SessionReport {
                    task_count: self.spec.task_count,
                    resubmissions: self.resubmissions,
                    polls: self.polls,
                });
            }
        }
    }

    async fn submit_wave(
        &mut self,
        client: &mut dyn SchedulerClient,
        range: IndexRange,
    ) -> crate::Result<()> {
        log::info!(
            "Submitting tasks {}-{} of {}",
            range.start,
            range.end(),
            self.spec.task_count
        );
        let mut ids = client
            .submit_array(self.spec, &self.plan, range)
            .await
            .map_err(|error| WaverunError::Submission(format!("{error:?}")))?;
        for index in range.iter() {
            let job_id = ids.remove(&index).ok_or_else(|| {
                WaverunError::Submission(format!("Scheduler returned no job id for task {index}"))
            })?;
            self.records.push(JobRecord::new(index, job_id));
        }
        Ok(())
    }

    /// One poll tick: query every live record, classify, resubmit failures and
    /// dispatch the next wave.
    async fn poll_once(&mut self, client: &mut dyn SchedulerClient) -> crate::Result<()> {
        self.polls += 1;

        let query = {
            let pending: Vec<&JobRecord> =
                self.records.iter().filter(|r| !r.completed).collect();
            client.query_states(&pending)
        };
        let states: TaskStateMap = match query.await {
            Ok(states) => states,
            Err(error) => {
                // A failed status query is not a task failure; the same ids
                // are re-queried on the next tick.
                log::warn!("Status query failed, will retry: {error:?}");
                return Ok(());
            }
        };

        let mut to_resubmit: Vec<usize> = Vec::new();
        for pos in 0..self.records.len() {
            let (task_index, job_id, completed) = {
                let record = &self.records[pos];
                (record.task_index, record.job_id.clone(), record.completed)
            };
            if completed {
                continue;
            }
            let state = match states.get(&job_id) {
                Some(Ok(state)) => *state,
                Some(Err(error)) => {
                    log::warn!("Cannot query state of task {task_index} (job {job_id}): {error:?}");
                    continue;
                }
                None => {
                    log::warn!("Scheduler returned no state for job {job_id}");
                    continue;
                }
            };
            match state {
                TaskState::TimedOut => {
                    // Fatal for the whole session; nothing gets resubmitted.
                    return Err(WaverunError::TaskTimeout {
                        task_index,
                        job_id,
                        budget: self.spec.task_time,
                    });
                }
                TaskState::Completed => {
                    log::debug!("Task {task_index} completed (job {job_id})");
                    self.records[pos].completed = true;
                }
                TaskState::Failed | TaskState::NodeFailure => {
                    log::info!("Task {task_index} failed, retrying");
                    to_resubmit.push(pos);
                }
                TaskState::Pending => {}
            }
        }

        for pos in to_resubmit {
            let record = &self.records[pos];
            let task_index = record.task_index;
            if let Some(limit) = self.spec.retry_limit {
                if record.retries >= limit {
                    return Err(WaverunError::RetryLimitReached {
                        task_index,
                        retries: record.retries,
                        limit,
                    });
                }
            }
            let job_id = client
                .resubmit_task(self.spec, &self.plan, task_index)
                .await
                .map_err(|error| WaverunError::Submission(format!("{error:?}")))?;
            log::info!("Task {task_index} resubmitted as job {job_id}");
            self.records[pos].replace_job(job_id);
            self.resubmissions += 1;
        }

        let submitted = self.records.len() as u32;
        if submitted < self.spec.task_count {
            let live = self.records.iter().filter(|r| !r.completed).count() as u32;
            if let Some(range) = plan::next_wave(self.spec, submitted, live) {
                self.submit_wave(client, range).await?;
            }
        }
        Ok(())
    }

    fn all_completed(&self) -> bool {
        self.records.len() as u32 == self.spec.task_count
            && self.records.iter().all(|r| r.completed)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::rc::Rc;
    use std::time::Duration;

    use super::ExecutionSession;
    use crate::Map;
    use crate::checkpoint::Checkpoint;
    use crate::common::error::WaverunError;
    use crate::plan::{IndexRange, SubmissionPlan};
    use crate::scheduler::{ClientResult, JobId, SchedulerClient, TaskState, TaskStateMap};
    use crate::session::state::JobRecord;
    use crate::spec::{TaskArraySpec, TaskCallable};

    struct NullCheckpoint;

    impl Checkpoint for NullCheckpoint {
        fn checkpoint(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeState {
        /// Scripted per-query outcomes per task index; the last entry repeats
        /// and unscripted tasks report `Completed`.
        outcomes: Map<u32, VecDeque<TaskState>>,
        job_tasks: Map<JobId, u32>,
        submitted_ranges: Vec<IndexRange>,
        resubmitted: Vec<u32>,
        array_counter: u32,
        resubmit_counter: u32,
    }

    /// In-memory stand-in for a batch scheduler.
    #[derive(Clone, Default)]
    struct FakeScheduler {
        state: Rc<RefCell<FakeState>>,
    }

    impl FakeScheduler {
        fn script(&self, task_index: u32, outcomes: &[TaskState]) {
            self.state
                .borrow_mut()
                .outcomes
                .insert(task_index, outcomes.iter().copied().collect());
        }

        fn resubmitted(&self) -> Vec<u32> {
            self.state.borrow().resubmitted.clone()
        }

        fn submitted_ranges(&self) -> Vec<IndexRange> {
            self.state.borrow().submitted_ranges.clone()
        }
    }

    impl SchedulerClient for FakeScheduler {
        fn submit_array(
            &mut self,
            _spec: &TaskArraySpec,
            _plan: &SubmissionPlan,
            range: IndexRange,
        ) -> Pin<Box<dyn Future<Output = ClientResult<Map<u32, JobId>>>>> {
            let mut state = self.state.borrow_mut();
            state.array_counter += 1;
            let parent = 1000 * state.array_counter;
            state.submitted_ranges.push(range);
            let mut ids = Map::new();
            for index in range.iter() {
                let job_id = format!("{parent}_{index}");
                state.job_tasks.insert(job_id.clone(), index);
                ids.insert(index, job_id);
            }
            Box::pin(async move { Ok(ids) })
        }

        fn resubmit_task(
            &mut self,
            _spec: &TaskArraySpec,
            _plan: &SubmissionPlan,
            task_index: u32,
        ) -> Pin<Box<dyn Future<Output = ClientResult<JobId>>>> {
            let mut state = self.state.borrow_mut();
            state.resubmit_counter += 1;
            let job_id = format!("r{}", state.resubmit_counter);
            state.job_tasks.insert(job_id.clone(), task_index);
            state.resubmitted.push(task_index);
            Box::pin(async move { Ok(job_id) })
        }

        fn query_states(
            &self,
            records: &[&JobRecord],
        ) -> Pin<Box<dyn Future<Output = ClientResult<TaskStateMap>>>> {
            let mut state = self.state.borrow_mut();
            let mut result = TaskStateMap::new();
            for record in records {
                let task_index = state.job_tasks[&record.job_id];
                let outcome = match state.outcomes.get_mut(&task_index) {
                    Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                    Some(queue) => *queue.front().unwrap(),
                    None => TaskState::Completed,
                };
                result.insert(record.job_id.clone(), Ok(outcome));
            }
            Box::pin(async move { Ok(result) })
        }
    }

    fn spec(task_count: u32, max_concurrent: u32) -> TaskArraySpec {
        TaskArraySpec {
            name: "test".to_string(),
            task_count,
            cores_per_task: 4,
            cores_per_node: 24,
            max_concurrent,
            task_time: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(1),
            retry_limit: None,
            runner: "/opt/waverun/run".into(),
            callable: TaskCallable {
                object: "solver".to_string(),
                method: "eval_func".to_string(),
            },
            env: Vec::new(),
            workdir: "/scratch/test".into(),
        }
    }

    fn plan() -> SubmissionPlan {
        SubmissionPlan {
            nodes_per_task: 1,
            partition: None,
            sbatch_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn all_tasks_complete_on_first_poll() {
        let spec = spec(4, 4);
        let mut client = FakeScheduler::default();
        let mut session = ExecutionSession::new(&spec, plan());

        let report = session.run(&mut client, &NullCheckpoint).await.unwrap();
        assert_eq!(report.resubmissions, 0);
        assert_eq!(report.polls, 1);
        assert!(client.resubmitted().is_empty());
        assert_eq!(client.submitted_ranges(), vec![IndexRange::new(0, 4)]);
        assert!(session.records().iter().all(|r| r.completed && r.retries == 0));
    }

    #[tokio::test]
    async fn failed_task_is_resubmitted_in_place() {
        let spec = spec(4, 4);
        let mut client = FakeScheduler::default();
        client.script(1, &[TaskState::Failed, TaskState::Completed]);
        let mut session = ExecutionSession::new(&spec, plan());

        let report = session.run(&mut client, &NullCheckpoint).await.unwrap();
        assert_eq!(report.resubmissions, 1);
        assert_eq!(client.resubmitted(), vec![1]);

        let records = session.records();
        let indices: Vec<u32> = records.iter().map(|r| r.task_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(records[1].job_id, "r1");
        assert_eq!(records[1].retries, 1);
        // Replacing task 1 must not touch anyone else's identity.
        for index in [0usize, 2, 3] {
            assert_eq!(records[index].job_id, format!("1000_{index}"));
            assert_eq!(records[index].retries, 0);
        }
    }

    #[tokio::test]
    async fn timeout_aborts_without_resubmissions() {
        let spec = spec(4, 4);
        let mut client = FakeScheduler::default();
        client.script(0, &[TaskState::Failed, TaskState::Completed]);
        client.script(2, &[TaskState::TimedOut]);
        let mut session = ExecutionSession::new(&spec, plan());

        let error = session
            .run(&mut client, &NullCheckpoint)
            .await
            .unwrap_err();
        match error {
            WaverunError::TaskTimeout {
                task_index,
                job_id,
                budget,
            } => {
                assert_eq!(task_index, 2);
                assert_eq!(job_id, "1000_2");
                assert_eq!(budget, Duration::from_secs(1800));
            }
            other => panic!("Unexpected error: {other:?}"),
        }
        // The failure of task 0 observed in the same tick must not have been
        // acted upon.
        assert!(client.resubmitted().is_empty());
    }

    #[tokio::test]
    async fn waves_cover_the_whole_array() {
        let spec = spec(5, 2);
        let mut client = FakeScheduler::default();
        let mut session = ExecutionSession::new(&spec, plan());

        let report = session.run(&mut client, &NullCheckpoint).await.unwrap();
        assert_eq!(
            client.submitted_ranges(),
            vec![
                IndexRange::new(0, 2),
                IndexRange::new(2, 2),
                IndexRange::new(4, 1)
            ]
        );
        assert_eq!(report.polls, 3);
        assert_eq!(report.resubmissions, 0);
        let indices: Vec<u32> = session.records().iter().map(|r| r.task_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn pending_tasks_keep_the_session_running() {
        let spec = spec(1, 1);
        let mut client = FakeScheduler::default();
        client.script(
            0,
            &[TaskState::Pending, TaskState::Pending, TaskState::Completed],
        );
        let mut session = ExecutionSession::new(&spec, plan());

        let report = session.run(&mut client, &NullCheckpoint).await.unwrap();
        assert_eq!(report.polls, 3);
        assert_eq!(report.resubmissions, 0);
    }

    #[tokio::test]
    async fn retry_limit_converts_to_fatal_error() {
        let mut spec = spec(1, 1);
        spec.retry_limit = Some(1);
        let mut client = FakeScheduler::default();
        client.script(
            0,
            &[TaskState::Failed, TaskState::Failed, TaskState::Completed],
        );
        let mut session = ExecutionSession::new(&spec, plan());

        let error = session
            .run(&mut client, &NullCheckpoint)
            .await
            .unwrap_err();
        match error {
            WaverunError::RetryLimitReached {
                task_index,
                retries,
                limit,
            } => {
                assert_eq!(task_index, 0);
                assert_eq!(retries, 1);
                assert_eq!(limit, 1);
            }
            other => panic!("Unexpected error: {other:?}"),
        }
    }
}
