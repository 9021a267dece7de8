use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use waverun::checkpoint::JsonCheckpoint;
use waverun::common::setup::setup_logging;
use waverun::plan::SubmissionPlan;
use waverun::profile::SiteProfile;
use waverun::scheduler::slurm::SlurmClient;
use waverun::session::ExecutionSession;
use waverun::spec::{TaskArraySpec, TaskCallable};

#[derive(Parser)]
#[command(
    version,
    about = "Fault-tolerant job-array execution for Slurm clusters"
)]
struct RootOptions {
    /// Number of tasks in the array
    #[arg(long, short = 'n')]
    ntasks: u32,

    /// Cores used by a single task
    #[arg(long, default_value_t = 1)]
    cores_per_task: u32,

    /// Cores available on one node; overrides the site profile
    #[arg(long)]
    cores_per_node: Option<u32>,

    /// Maximum number of concurrently submitted tasks [default: ntasks]
    #[arg(long)]
    max_concurrent: Option<u32>,

    /// Per-task time budget, e.g. `30m` or `2h`
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30m")]
    task_time: Duration,

    /// Delay between status polls
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    poll_interval: Duration,

    /// Abort after this many resubmissions of a single task [default: unlimited]
    #[arg(long)]
    retry_limit: Option<u32>,

    /// TOML site profile with node size and partition names
    #[arg(long, env = "WAVERUN_PROFILE")]
    profile: Option<PathBuf>,

    /// Working directory for submission scripts and task output
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Job name used for scheduler submissions
    #[arg(long, default_value = "waverun")]
    name: String,

    /// KEY=VALUE pair exported into every task's environment; can be repeated
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Enable debug output
    #[arg(long)]
    verbose: bool,

    /// Worker wrapper executable run by every task
    runner: PathBuf,

    /// Object whose method each task dispatches
    object: String,

    /// Method dispatched on the object
    method: String,
}

fn parse_env_pair(raw: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        anyhow::bail!("Empty variable name in `{raw}`");
    }
    Ok((key.to_string(), value.to_string()))
}

async fn run_array(opts: RootOptions) -> anyhow::Result<()> {
    let profile = match &opts.profile {
        Some(path) => SiteProfile::from_file(path)
            .with_context(|| format!("Cannot load site profile {}", path.display()))?,
        None => SiteProfile::generic(),
    };

    std::fs::create_dir_all(&opts.workdir)
        .with_context(|| format!("Cannot create working directory {}", opts.workdir.display()))?;

    let spec = TaskArraySpec {
        name: opts.name,
        task_count: opts.ntasks,
        cores_per_task: opts.cores_per_task,
        cores_per_node: opts.cores_per_node.unwrap_or(profile.cores_per_node),
        max_concurrent: opts.max_concurrent.unwrap_or(opts.ntasks),
        task_time: opts.task_time,
        poll_interval: opts.poll_interval,
        retry_limit: opts.retry_limit,
        runner: opts.runner,
        callable: TaskCallable {
            object: opts.object,
            method: opts.method,
        },
        env: opts.env,
        workdir: opts.workdir,
    };
    spec.validate()?;

    let plan = SubmissionPlan::from_spec(&spec, &profile);
    log::info!(
        "Array `{}` on {}: {} tasks, {} node(s) per task{}",
        spec.name,
        profile.name,
        spec.task_count,
        plan.nodes_per_task,
        plan.partition
            .as_deref()
            .map(|p| format!(", partition {p}"))
            .unwrap_or_default()
    );

    let mut client = SlurmClient::new(&spec.workdir);
    let checkpoint = JsonCheckpoint::new(&spec.workdir, &spec);
    let mut session = ExecutionSession::new(&spec, plan);
    let report = session.run(&mut client, &checkpoint).await?;

    log::info!(
        "Finished: {} tasks, {} resubmissions, {} polls",
        report.task_count,
        report.resubmissions,
        report.polls
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = RootOptions::parse();
    setup_logging(opts.verbose);

    if let Err(error) = run_array(opts).await {
        log::error!("{error:?}");
        std::process::exit(1);
    }
}
