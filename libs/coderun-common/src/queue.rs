use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::tasks::Task;

/// Delivery contract between producer and worker
///
/// - At-least-once: a message stays in the worker's active list until it is
///   acked, rescheduled or archived, and is requeued if that worker restarts.
/// - A task's id is its execution id; the broker never holds two live
///   messages for the same id because runs are enqueued exactly once and a
///   retry replaces the active message.

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-task options fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub timeout: Duration,
    pub max_retry: u32,
}

/// A task plus the broker's retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(flatten)]
    pub task: Task,
    pub retried: u32,
    pub max_retry: u32,
    pub timeout_ms: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskMessage {
    pub fn new(task: Task, options: EnqueueOptions) -> Self {
        Self {
            task,
            retried: 0,
            max_retry: options.max_retry,
            timeout_ms: options.timeout.as_millis() as u64,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Copy scheduled for another attempt.
    pub fn next_attempt(&self, error: &str) -> Self {
        Self {
            retried: self.retried + 1,
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }
}

/// A message handed to one worker. `raw` is the exact encoding held in the
/// active list so the broker can remove it again.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TaskMessage,
    pub raw: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Move the next pending message into this worker's active list.
    /// Non-blocking; `None` when nothing is pending.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// The attempt finished; drop the message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reschedule the message `delay` from now with its retry count bumped.
    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Give up on the message and keep it for inspection.
    async fn archive(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;

    /// Move scheduled messages whose time has come back to pending.
    async fn forward_scheduled(&self) -> Result<usize, QueueError>;

    /// Requeue messages left in this worker's active list by a previous run.
    async fn recover_orphans(&self) -> Result<usize, QueueError>;
}
