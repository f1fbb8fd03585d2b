/// Task Processor - drives one execution record through its lifecycle
///
/// Per attempt:
/// 1. Decode the task; an unreadable task fails its record
/// 2. Ask the admission controller; a denial leaves the record untouched
/// 3. Run the attempt (mark running, launch runtime, persist output) on its
///    own tokio task, racing it against the cancellation token. A launch
///    failure fails the record; a store error leaves it for the retry
/// 4. Cancellation winning means the time budget is spent: the attempt is
///    aborted and the record finalized as timed out
///
/// The processor never decides retries; it reports a `TaskError` and the
/// server applies the retry policy.

use coderun_common::store::{ExecutionStore, ExecutionUpdate, StoreError, Transition};
use coderun_common::tasks::{CompilePayload, Task};
use coderun_common::types::ExecutionStatus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::error::TaskError;
use crate::runner::Runner;

pub struct TaskProcessor {
    store: Arc<dyn ExecutionStore>,
    admission: Arc<AdmissionController>,
    runner: Arc<Runner>,
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        admission: Arc<AdmissionController>,
        runner: Arc<Runner>,
    ) -> Self {
        Self {
            store,
            admission,
            runner,
        }
    }

    #[instrument(skip(self, task, cancel), fields(execution_id = %task.id, task_type = %task.type_tag))]
    pub async fn process(&self, task: &Task, cancel: CancellationToken) -> Result<(), TaskError> {
        let payload = match task.decode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Undecodable task");
                self.mark_failed(task.id).await;
                return Err(TaskError::PayloadDecode(e));
            }
        };

        if !self.admission.try_admit() {
            let retry_in = self.admission.backoff();
            debug!(retry_in_ms = retry_in.as_millis() as u64, "Admission denied");
            return Err(TaskError::AdmissionDenied { retry_in });
        }

        let execution_id = payload.execution_id;
        let mut attempt = tokio::spawn(
            run_attempt(self.store.clone(), self.runner.clone(), payload).in_current_span(),
        );

        tokio::select! {
            biased;

            joined = &mut attempt => {
                let result = joined.unwrap_or_else(|e| Err(TaskError::Aborted(e.to_string())));
                if let Err(e) = &result {
                    error!(error = %e, "Execution attempt failed");
                    if e.fails_record() {
                        self.mark_failed(execution_id).await;
                    }
                }
                result
            }
            _ = cancel.cancelled() => {
                attempt.abort();
                // Wait for the abort so the process group and workspace are gone
                // before the record says so.
                let _ = attempt.await;
                self.mark_timeout(execution_id).await?;
                Err(TaskError::Timeout)
            }
        }
    }

    /// Best-effort secondary write. Logged, never returned, so the primary
    /// error is what reaches the broker.
    async fn mark_failed(&self, execution_id: Uuid) {
        match self
            .store
            .transition(execution_id, ExecutionUpdate::status(ExecutionStatus::Failed))
            .await
        {
            Ok(Transition::Applied { from }) => {
                info!(execution_id = %execution_id, from = %from, "Execution marked failed");
            }
            Ok(Transition::Rejected { current }) => {
                warn!(execution_id = %execution_id, status = %current, "Execution already final, not marking failed");
            }
            Ok(Transition::Missing) => {
                warn!(execution_id = %execution_id, "No execution record to mark failed");
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Failed to mark execution failed");
            }
        }
    }

    /// Runs after the token fired and outside the aborted attempt, so the
    /// cancellation cannot cut this write short.
    async fn mark_timeout(&self, execution_id: Uuid) -> Result<(), TaskError> {
        let update = ExecutionUpdate::status(ExecutionStatus::Timeout);
        match self.store.transition(execution_id, update).await? {
            Transition::Applied { from } => {
                warn!(execution_id = %execution_id, from = %from, "Execution timed out");
                Ok(())
            }
            Transition::Rejected { current } => {
                warn!(execution_id = %execution_id, status = %current, "Deadline hit after execution was finalized");
                Ok(())
            }
            Transition::Missing => Err(StoreError::NotFound(execution_id).into()),
        }
    }
}

async fn run_attempt(
    store: Arc<dyn ExecutionStore>,
    runner: Arc<Runner>,
    payload: CompilePayload,
) -> Result<(), TaskError> {
    let execution_id = payload.execution_id;

    match store
        .transition(execution_id, ExecutionUpdate::status(ExecutionStatus::Running))
        .await?
    {
        Transition::Applied { from } => {
            debug!(from = %from, language = %payload.language, "Execution running");
        }
        Transition::Rejected { current } => {
            // Redelivery of a task whose record is already final.
            warn!(status = %current, "Execution already finalized, skipping");
            return Ok(());
        }
        Transition::Missing => return Err(StoreError::NotFound(execution_id).into()),
    }

    let output = runner.run(&payload).await?;

    info!(
        execution_time_ms = output.execution_time_ms,
        stdout_bytes = output.stdout.len(),
        stderr_bytes = output.stderr.len(),
        "Execution completed"
    );

    match store
        .transition(execution_id, ExecutionUpdate::completed(output))
        .await?
    {
        Transition::Applied { .. } => Ok(()),
        Transition::Rejected { current } => {
            warn!(status = %current, "Execution finalized elsewhere, output dropped");
            Ok(())
        }
        Transition::Missing => Err(StoreError::NotFound(execution_id).into()),
    }
}
