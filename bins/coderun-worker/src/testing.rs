//! In-memory broker and store for exercising the pipeline without Redis.

use async_trait::async_trait;
use chrono::Utc;
use coderun_common::queue::{Broker, Delivery, EnqueueOptions, QueueError, TaskMessage};
use coderun_common::store::{ExecutionStore, ExecutionUpdate, StoreError, Transition};
use coderun_common::tasks::Task;
use coderun_common::types::{Execution, ExecutionStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{LanguageConfigManager, LanguageRuntime, FILE_PLACEHOLDER, SOURCE_PLACEHOLDER};

/// Keeps every status a record has been in, in order.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, (Execution, Vec<ExecutionStatus>)>>,
    fail_next: Mutex<Option<ExecutionStatus>>,
}

impl MemoryStore {
    pub fn insert_queued(&self, id: Uuid) {
        let execution = Execution::queued(id, None);
        self.records
            .lock()
            .unwrap()
            .insert(id, (execution, vec![ExecutionStatus::Queued]));
    }

    pub fn record(&self, id: Uuid) -> Execution {
        self.records.lock().unwrap()[&id].0.clone()
    }

    pub fn history(&self, id: Uuid) -> Vec<ExecutionStatus> {
        self.records.lock().unwrap()[&id].1.clone()
    }

    /// The next write of `status` fails with a connection error, once.
    pub fn fail_next(&self, status: ExecutionStatus) {
        *self.fail_next.lock().unwrap() = Some(status);
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.records.lock().unwrap().get(&id).map(|(e, _)| e.clone()))
    }

    async fn transition(&self, id: Uuid, update: ExecutionUpdate) -> Result<Transition, StoreError> {
        {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next == Some(update.status) {
                *fail_next = None;
                let blip = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
                return Err(StoreError::Redis(blip));
            }
        }

        let mut records = self.records.lock().unwrap();
        let Some((execution, history)) = records.get_mut(&id) else {
            return Ok(Transition::Missing);
        };

        let from = execution.status;
        if !from.can_transition_to(update.status) {
            return Ok(Transition::Rejected { current: from });
        }

        execution.status = update.status;
        execution.updated_at = Utc::now();
        if let Some(output) = update.output {
            execution.stdout = Some(output.stdout);
            execution.stderr = Some(output.stderr);
            execution.execution_time_ms = Some(output.execution_time_ms);
        }
        history.push(update.status);
        Ok(Transition::Applied { from })
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    pending: Mutex<VecDeque<TaskMessage>>,
    pub acked: Mutex<Vec<Uuid>>,
    pub retried: Mutex<Vec<(TaskMessage, Duration)>>,
    pub archived: Mutex<Vec<TaskMessage>>,
}

impl MemoryBroker {
    pub fn push(&self, message: TaskMessage) {
        self.pending.lock().unwrap().push_back(message);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let message = self.pending.lock().unwrap().pop_front();
        Ok(message.map(|message| Delivery {
            raw: serde_json::to_string(&message).unwrap(),
            message,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.acked.lock().unwrap().push(delivery.message.task.id);
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.retried
            .lock()
            .unwrap()
            .push((delivery.message.next_attempt(error), delay));
        Ok(())
    }

    async fn archive(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut message = delivery.message.clone();
        message.last_error = Some(error.to_string());
        self.archived.lock().unwrap().push(message);
        Ok(())
    }

    async fn forward_scheduled(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn recover_orphans(&self) -> Result<usize, QueueError> {
        Ok(0)
    }
}

/// `sh` standing in for both toolchains: python runs the source inline, go
/// runs it from a file in the temporary workspace.
pub fn shell_runtimes() -> LanguageConfigManager {
    LanguageConfigManager::from_runtimes(vec![
        LanguageRuntime {
            name: "python".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), SOURCE_PLACEHOLDER.to_string()],
            source_file: None,
        },
        LanguageRuntime {
            name: "go".to_string(),
            command: "sh".to_string(),
            args: vec![FILE_PLACEHOLDER.to_string()],
            source_file: Some("main.go".to_string()),
        },
    ])
    .unwrap()
}

pub fn message(task: Task, timeout: Duration, max_retry: u32) -> TaskMessage {
    TaskMessage::new(task, EnqueueOptions { timeout, max_retry })
}
