use coderun_common::store::StoreError;
use coderun_common::tasks::DecodeError;
use coderun_common::types::Language;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed task attempt, as reported back to the broker.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to decode task: {0}")]
    PayloadDecode(#[from] DecodeError),

    /// Backpressure from the admission controller. Not a failure.
    #[error("rate limited (retry in {retry_in:?})")]
    AdmissionDenied { retry_in: Duration },

    #[error("failed to launch {language} runtime: {reason}")]
    SubprocessLaunch { language: Language, reason: String },

    #[error("execution exceeded its time budget")]
    Timeout,

    #[error("execution record update failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("execution attempt aborted: {0}")]
    Aborted(String),
}

impl TaskError {
    /// Delay requested by the error itself, overriding the default curve.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TaskError::AdmissionDenied { retry_in } => Some(*retry_in),
            _ => None,
        }
    }

    /// Whether the error counts as an infrastructure failure for alerting.
    pub fn is_failure(&self) -> bool {
        !matches!(self, TaskError::AdmissionDenied { .. })
    }

    /// Whether the attempt's outcome is final for the record. Persistence
    /// errors leave the record as it was so the retry can run the code again.
    pub fn fails_record(&self) -> bool {
        matches!(
            self,
            TaskError::PayloadDecode(_) | TaskError::SubprocessLaunch { .. } | TaskError::Aborted(_)
        )
    }

    /// Whether remaining retries must be skipped.
    pub fn skips_retry(&self) -> bool {
        matches!(self, TaskError::Timeout)
    }
}
