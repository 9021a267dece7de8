use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::TaskArraySpec;

/// Called right before the initial submission, so that enough state exists on
/// disk for an outer workflow layer to resume an interrupted session.
pub trait Checkpoint {
    fn checkpoint(&self) -> anyhow::Result<()>;
}

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Record written by [`JsonCheckpoint`].
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: String,
    pub written_at: DateTime<Utc>,
    pub spec: TaskArraySpec,
}

/// Persists a timestamped JSON snapshot of the resolved spec into the working
/// directory.
pub struct JsonCheckpoint {
    directory: PathBuf,
    spec: TaskArraySpec,
}

impl JsonCheckpoint {
    pub fn new(directory: &Path, spec: &TaskArraySpec) -> JsonCheckpoint {
        JsonCheckpoint {
            directory: directory.to_path_buf(),
            spec: spec.clone(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(CHECKPOINT_FILE)
    }
}

impl Checkpoint for JsonCheckpoint {
    fn checkpoint(&self) -> anyhow::Result<()> {
        let record = CheckpointRecord {
            version: crate::WAVERUN_VERSION.to_string(),
            written_at: Utc::now(),
            spec: self.spec.clone(),
        };
        let path = self.path();
        log::debug!("Saving checkpoint into {path:?}");
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Cannot create checkpoint file {path:?}"))?;
        serde_json::to_writer_pretty(file, &record).context("Cannot serialize checkpoint")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Checkpoint, CheckpointRecord, JsonCheckpoint};
    use crate::spec::{TaskArraySpec, TaskCallable};

    #[test]
    fn checkpoint_roundtrip() {
        let spec = TaskArraySpec {
            name: "test".to_string(),
            task_count: 2,
            cores_per_task: 4,
            cores_per_node: 24,
            max_concurrent: 2,
            task_time: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            retry_limit: Some(5),
            runner: "/opt/waverun/run".into(),
            callable: TaskCallable {
                object: "solver".to_string(),
                method: "eval_func".to_string(),
            },
            env: Vec::new(),
            workdir: "/scratch/test".into(),
        };

        let tmp = tempfile::TempDir::new().unwrap();
        let checkpoint = JsonCheckpoint::new(tmp.path(), &spec);
        checkpoint.checkpoint().unwrap();

        let raw = std::fs::read_to_string(checkpoint.path()).unwrap();
        let record: CheckpointRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.spec.task_count, 2);
        assert_eq!(record.spec.retry_limit, Some(5));
        assert_eq!(record.version, crate::WAVERUN_VERSION);
    }
}
