//! Worker pool: pulls tasks from the broker, wraps each attempt in its
//! per-task deadline and feeds the outcome through the retry policy.

use coderun_common::queue::{Broker, Delivery};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::processor::TaskProcessor;
use crate::retry::{self, RetryDecision};

const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Server {
    broker: Arc<dyn Broker>,
    processor: Arc<TaskProcessor>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Server {
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<TaskProcessor>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            processor,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Run until `shutdown` fires. Workers stop pulling new tasks on shutdown
    /// but finish the attempt they hold.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        match self.broker.recover_orphans().await {
            Ok(0) => {}
            Ok(n) => warn!(recovered = n, "Requeued tasks left active by a previous run"),
            Err(e) => error!(error = %e, "Failed to recover orphaned tasks"),
        }

        let mut workers = JoinSet::new();

        let forwarder = self.clone();
        let forwarder_shutdown = shutdown.clone();
        workers.spawn(async move { forwarder.forward_loop(forwarder_shutdown).await });

        for worker_id in 0..self.concurrency {
            let server = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { server.worker_loop(worker_id, shutdown).await });
        }

        info!(concurrency = self.concurrency, "Worker pool started");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }

        info!("Worker pool stopped");
    }

    async fn forward_loop(&self, shutdown: CancellationToken) {
        loop {
            match self.broker.forward_scheduled().await {
                Ok(0) => {}
                Ok(n) => debug!(forwarded = n, "Scheduled tasks ready"),
                Err(e) => error!(error = %e, "Failed to forward scheduled tasks"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!(worker_id, "Worker started");
        while !shutdown.is_cancelled() {
            match self.broker.dequeue().await {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Broker error");
                    tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    /// Run one delivery under its deadline and settle it with the broker.
    pub async fn handle(&self, delivery: Delivery) {
        let message = &delivery.message;
        info!(
            execution_id = %message.task.id,
            task_type = %message.task.type_tag,
            retried = message.retried,
            timeout_ms = message.timeout_ms,
            "Received task"
        );

        let cancel = CancellationToken::new();
        let processing = self.processor.process(&message.task, cancel.clone());
        tokio::pin!(processing);

        let result = tokio::select! {
            result = &mut processing => result,
            _ = tokio::time::sleep(message.timeout()) => {
                cancel.cancel();
                processing.await
            }
        };

        self.settle(&delivery, result).await;
    }

    async fn settle(&self, delivery: &Delivery, result: Result<(), TaskError>) {
        let message = &delivery.message;
        let execution_id = message.task.id;

        let error = match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(delivery).await {
                    error!(execution_id = %execution_id, error = %e, "Failed to ack task");
                }
                return;
            }
            Err(error) => error,
        };

        if error.is_failure() {
            error!(execution_id = %execution_id, error = %error, retried = message.retried, "Task attempt failed");
        } else {
            info!(execution_id = %execution_id, error = %error, "Task deferred by admission control");
        }

        let reason = error.to_string();
        let settled = match retry::decide(&error, message.retried, message.max_retry) {
            RetryDecision::Retry { delay } => {
                debug!(execution_id = %execution_id, delay_ms = delay.as_millis() as u64, "Scheduling retry");
                self.broker.retry(delivery, delay, &reason).await
            }
            RetryDecision::Archive => {
                warn!(
                    execution_id = %execution_id,
                    retried = message.retried,
                    max_retry = message.max_retry,
                    skip_retry = error.skips_retry(),
                    "Archiving task"
                );
                self.broker.archive(delivery, &reason).await
            }
        };

        if let Err(e) = settled {
            error!(execution_id = %execution_id, error = %e, "Failed to settle task with broker");
        }
    }
}
