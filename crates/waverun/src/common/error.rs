use std::time::Duration;

use thiserror::Error;

use crate::common::error::WaverunError::GenericError;

#[derive(Debug, Error)]
pub enum WaverunError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Submission rejected by scheduler: {0}")]
    Submission(String),
    #[error("Task {task_index} (job {job_id}) exceeded its time budget of {budget:?}")]
    TaskTimeout {
        task_index: u32,
        job_id: String,
        budget: Duration,
    },
    #[error("Task {task_index} failed {retries} times, exceeding the retry limit of {limit}")]
    RetryLimitReached {
        task_index: u32,
        retries: u32,
        limit: u32,
    },
    #[error("Profile error: {0}")]
    ProfileError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for WaverunError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<toml::de::Error> for WaverunError {
    fn from(error: toml::de::Error) -> Self {
        Self::ProfileError(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for WaverunError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
