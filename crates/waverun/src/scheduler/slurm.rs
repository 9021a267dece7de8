use std::fmt::Write;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;

use crate::Map;
use crate::common::env::WAVERUN_TASK_ID;
use crate::plan::{IndexRange, SubmissionPlan};
use crate::scheduler::common::{SubmitDirs, check_command_output, create_command, submit_script};
use crate::scheduler::{ClientResult, JobId, SchedulerClient, TaskState, TaskStateMap};
use crate::session::state::JobRecord;
use crate::spec::TaskArraySpec;

/// Client of a Slurm cluster: arrays go in through `sbatch`, states come back
/// out of `scontrol show job`.
pub struct SlurmClient {
    dirs: SubmitDirs,
}

impl SlurmClient {
    pub fn new(workdir: &Path) -> SlurmClient {
        SlurmClient {
            dirs: SubmitDirs::new(workdir),
        }
    }
}

enum SubmitKind {
    /// One `--array` submission covering a range of task indices.
    Array(IndexRange),
    /// A single replacement job for one task index.
    Single(u32),
}

impl SchedulerClient for SlurmClient {
    fn submit_array(
        &mut self,
        spec: &TaskArraySpec,
        plan: &SubmissionPlan,
        range: IndexRange,
    ) -> Pin<Box<dyn Future<Output = ClientResult<Map<u32, JobId>>>>> {
        let spec = spec.clone();
        let plan = plan.clone();
        let system_dir = self.dirs.system_dir().to_path_buf();
        let directory = self.dirs.next();

        Box::pin(async move {
            let directory = directory.context("Cannot create submission directory")?;
            let script = build_submit_script(
                &spec,
                &plan,
                &SubmitKind::Array(range),
                &directory,
                &system_dir,
            );
            let parent = submit_script(script, "sbatch", &directory, parse_sbatch_job_id).await?;
            Ok(range
                .iter()
                .map(|index| (index, array_task_job_id(&parent, index)))
                .collect())
        })
    }

    fn resubmit_task(
        &mut self,
        spec: &TaskArraySpec,
        plan: &SubmissionPlan,
        task_index: u32,
    ) -> Pin<Box<dyn Future<Output = ClientResult<JobId>>>> {
        let spec = spec.clone();
        let plan = plan.clone();
        let system_dir = self.dirs.system_dir().to_path_buf();
        let directory = self.dirs.next();

        Box::pin(async move {
            let directory = directory.context("Cannot create submission directory")?;
            let script = build_submit_script(
                &spec,
                &plan,
                &SubmitKind::Single(task_index),
                &directory,
                &system_dir,
            );
            submit_script(script, "sbatch", &directory, parse_sbatch_job_id).await
        })
    }

    fn query_states(
        &self,
        records: &[&JobRecord],
    ) -> Pin<Box<dyn Future<Output = ClientResult<TaskStateMap>>>> {
        let jobs: Vec<(u32, JobId)> = records
            .iter()
            .map(|record| (record.task_index, record.job_id.clone()))
            .collect();
        let system_dir = self.dirs.system_dir().to_path_buf();

        Box::pin(async move {
            let mut result = Map::with_capacity(jobs.len());
            for (task_index, job_id) in jobs {
                let state = get_task_state(&job_id, task_index, &system_dir).await;
                result.insert(job_id, state);
            }
            Ok(result)
        })
    }
}

/// External id of one element of a submitted array.
fn array_task_job_id(parent: &str, index: u32) -> JobId {
    format!("{parent}_{index}")
}

fn parse_sbatch_job_id(output: &str) -> ClientResult<JobId> {
    log::debug!("Sbatch output: {output}");
    output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.to_lowercase().starts_with("submitted batch job"))
        .and_then(|l| l.split(' ').nth(3))
        .map(|l| l.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing job id in sbatch output\n{output}"))
}

async fn get_task_state(job_id: &str, task_index: u32, system_dir: &Path) -> ClientResult<TaskState> {
    let arguments = vec!["scontrol", "show", "job", job_id];
    log::debug!("Running Slurm command `{}`", arguments.join(" "));

    let mut command = create_command(arguments, system_dir);
    let output = command.output().await.context("scontrol start failed")?;

    if !output.status.success() && is_unknown_job(&output.stderr) {
        // The job has aged out of the scheduler's history. Without an on-disk
        // failure marker the task is taken as finished.
        return Ok(if failure_marker(system_dir, task_index).exists() {
            TaskState::Failed
        } else {
            TaskState::Completed
        });
    }

    let output = check_command_output(output).context("scontrol execution failed")?;
    let output = output
        .stdout
        .to_str()
        .map_err(|err| anyhow::anyhow!("Invalid UTF-8 in scontrol output: {:?}", err))?;
    parse_task_state(&get_scontrol_items(output))
}

fn is_unknown_job(stderr: &[u8]) -> bool {
    stderr.to_str_lossy().contains("Invalid job id specified")
}

/// Marker written by the submit script when the worker command exits nonzero,
/// so that a failure stays observable after the job record expires.
pub fn failure_marker(system_dir: &Path, task_index: u32) -> PathBuf {
    system_dir.join(format!("task-{task_index}.failed"))
}

fn parse_task_state(items: &Map<&str, &str>) -> ClientResult<TaskState> {
    let state = items
        .get("JobState")
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Missing JobState in scontrol output"))?;
    Ok(match state {
        "PENDING" | "CONFIGURING" | "RUNNING" | "COMPLETING" | "SUSPENDED" | "REQUEUED" => {
            TaskState::Pending
        }
        "COMPLETED" => TaskState::Completed,
        "FAILED" | "CANCELLED" | "OUT_OF_MEMORY" => TaskState::Failed,
        "NODE_FAIL" | "BOOT_FAIL" => TaskState::NodeFailure,
        "TIMEOUT" | "DEADLINE" => TaskState::TimedOut,
        _ => anyhow::bail!("Unknown Slurm job state {}", state),
    })
}

/// Parse <key>=<value> pairs from the output of `scontrol show job <job-id>`.
fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    for line in output.lines() {
        for item in line.trim().split(' ') {
            let iter: Vec<_> = item.split('=').take(2).collect();
            if iter.len() < 2 {
                continue;
            }
            let (key, value) = (iter[0], iter[1]);
            map.insert(key, value);
        }
    }
    map
}

/// Format a duration as a Slurm time string, e.g. 01:05:02
fn format_slurm_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

fn build_submit_script(
    spec: &TaskArraySpec,
    plan: &SubmissionPlan,
    kind: &SubmitKind,
    directory: &Path,
    system_dir: &Path,
) -> String {
    let mut script = format!(
        r##"#!/bin/bash
#SBATCH --job-name={name}
#SBATCH --nodes={nodes}
#SBATCH --ntasks={ntasks}
#SBATCH --ntasks-per-node={tasks_per_node}
#SBATCH --time={walltime}
#SBATCH --output={directory}/%j.out
#SBATCH --error={directory}/%j.err
"##,
        name = spec.name,
        nodes = plan.nodes_per_task,
        ntasks = spec.cores_per_task,
        tasks_per_node = spec.cores_per_task.min(spec.cores_per_node),
        walltime = format_slurm_duration(&spec.task_time),
        directory = directory.display(),
    );

    if let SubmitKind::Array(range) = kind {
        writeln!(script, "#SBATCH --array={}-{}", range.start, range.end()).unwrap();
    }
    if let Some(partition) = &plan.partition {
        writeln!(script, "#SBATCH --partition={partition}").unwrap();
    }
    for arg in &plan.sbatch_args {
        writeln!(script, "#SBATCH {arg}").unwrap();
    }

    script.push('\n');
    for (key, value) in &spec.env {
        writeln!(script, "export {key}=\"{value}\"").unwrap();
    }

    // A resubmitted job no longer runs as part of an array; it recovers its
    // task index from the exported override variable instead.
    let marker = match kind {
        SubmitKind::Array(_) => {
            format!("{}/task-${{SLURM_ARRAY_TASK_ID}}.failed", system_dir.display())
        }
        SubmitKind::Single(task_index) => {
            writeln!(script, "export {WAVERUN_TASK_ID}={task_index}").unwrap();
            failure_marker(system_dir, *task_index).display().to_string()
        }
    };

    write!(
        script,
        r##"MARKER="{marker}"
rm -f "$MARKER"
"{runner}" "{workdir}" {object} {method} || {{
    touch "$MARKER"
    exit 1
}}
"##,
        runner = spec.runner.display(),
        workdir = spec.workdir.display(),
        object = spec.callable.object,
        method = spec.callable.method,
    )
    .unwrap();
    script
}
