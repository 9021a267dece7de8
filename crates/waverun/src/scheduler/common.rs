use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::scheduler::{ClientResult, JobId};

/// Name of the script submitted to the scheduler.
const SUBMIT_SCRIPT_NAME: &str = "submit.sh";

/// Name of a file that will store the job id of a submission.
const JOBID_FILE_NAME: &str = "jobid";

/// Allocates per-submission directories under `<workdir>/system` that hold
/// the generated script, the scheduler's stdout/stderr and the job id, for
/// debugging failed submissions.
pub struct SubmitDirs {
    system_dir: PathBuf,
    submission_counter: u64,
}

impl SubmitDirs {
    pub fn new(workdir: &Path) -> SubmitDirs {
        SubmitDirs {
            system_dir: workdir.join("system"),
            submission_counter: 0,
        }
    }

    pub fn system_dir(&self) -> &Path {
        &self.system_dir
    }

    pub fn next(&mut self) -> std::io::Result<PathBuf> {
        self.submission_counter += 1;
        let dir = self.system_dir.join(format!("{:03}", self.submission_counter));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Submits a script with `program` and parses the job id out of the
/// scheduler's stdout. The script is kept in `directory` as debug information.
pub async fn submit_script<F>(
    script: String,
    program: &str,
    directory: &Path,
    get_job_id: F,
) -> ClientResult<JobId>
where
    F: FnOnce(&str) -> ClientResult<JobId>,
{
    let script_path = directory.join(SUBMIT_SCRIPT_NAME);
    let script_path = script_path.to_str().unwrap();

    std::fs::write(script_path, script)
        .with_context(|| anyhow::anyhow!("Cannot write script into {}", script_path))?;

    let arguments = vec![program, script_path];

    log::debug!("Running command `{}`", arguments.join(" "));
    let mut command = create_command(arguments, directory);

    let output = command
        .output()
        .await
        .with_context(|| format!("{program} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;
    let output = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", program, e))?
        .trim();

    let job_id = get_job_id(output)?;

    // Write the job id to the submission directory as a debug information
    std::fs::write(directory.join(JOBID_FILE_NAME), &job_id)?;

    Ok(job_id)
}

pub fn create_command(arguments: Vec<&str>, workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

pub fn check_command_output(output: Output) -> ClientResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::SubmitDirs;

    #[test]
    fn submission_directories_are_numbered() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut dirs = SubmitDirs::new(tmp.path());
        let first = dirs.next().unwrap();
        let second = dirs.next().unwrap();
        assert_eq!(first, tmp.path().join("system").join("001"));
        assert_eq!(second, tmp.path().join("system").join("002"));
        assert!(first.is_dir() && second.is_dir());
    }
}
