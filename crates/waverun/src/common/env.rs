use anyhow::Context;

// Known environment variables

/// Override variable carrying the task index of a resubmitted job, which no
/// longer runs as part of a scheduler array.
pub const WAVERUN_TASK_ID: &str = "WAVERUN_TASK_ID";
/// Array index variable set by Slurm inside array jobs.
pub const SLURM_ARRAY_TASK_ID: &str = "SLURM_ARRAY_TASK_ID";

/// Recovers the task index of the currently running worker process.
///
/// Initial submissions run as scheduler array jobs and read the scheduler's
/// array variable; resubmitted jobs carry the index in [`WAVERUN_TASK_ID`]
/// instead.
pub fn task_index_from_env() -> anyhow::Result<u32> {
    resolve_task_index(|name| std::env::var(name).ok())
}

fn resolve_task_index(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<u32> {
    for name in [SLURM_ARRAY_TASK_ID, WAVERUN_TASK_ID] {
        if let Some(value) = lookup(name) {
            return value
                .parse()
                .with_context(|| format!("Cannot parse {name}={value} as a task index"));
        }
    }
    anyhow::bail!("Neither {SLURM_ARRAY_TASK_ID} nor {WAVERUN_TASK_ID} is set");
}

#[cfg(test)]
mod tests {
    use super::{SLURM_ARRAY_TASK_ID, WAVERUN_TASK_ID, resolve_task_index};

    #[test]
    fn task_index_from_array_variable() {
        let index = resolve_task_index(|name| {
            (name == SLURM_ARRAY_TASK_ID).then(|| "7".to_string())
        });
        assert_eq!(index.unwrap(), 7);
    }

    #[test]
    fn task_index_from_override() {
        let index =
            resolve_task_index(|name| (name == WAVERUN_TASK_ID).then(|| "3".to_string()));
        assert_eq!(index.unwrap(), 3);
    }

    #[test]
    fn array_variable_wins_over_override() {
        let index = resolve_task_index(|name| match name {
            SLURM_ARRAY_TASK_ID => Some("1".to_string()),
            WAVERUN_TASK_ID => Some("2".to_string()),
            _ => None,
        });
        assert_eq!(index.unwrap(), 1);
    }

    #[test]
    fn missing_variables_fail() {
        assert!(resolve_task_index(|_| None).is_err());
    }

    #[test]
    fn unparsable_index_fails() {
        assert!(resolve_task_index(|_| Some("x7".to_string())).is_err());
    }
}
