//! Narrow contract the pipeline holds against the execution record store.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Execution, ExecutionStatus, RunOutput};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

/// A status write, optionally carrying the captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub output: Option<RunOutput>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self { status, output: None }
    }

    pub fn completed(output: RunOutput) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output: Some(output),
        }
    }
}

/// What happened to a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: ExecutionStatus },
    /// The record is in a state the update may not follow. Nothing was
    /// written.
    Rejected { current: ExecutionStatus },
    Missing,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Apply `update` only if the record's current status is one of
    /// `update.status.predecessors()`. The check and the write are atomic.
    async fn transition(&self, id: Uuid, update: ExecutionUpdate) -> Result<Transition, StoreError>;
}
