/// End-to-end tests for the execution pipeline
///
/// These drive the processor and the server's per-task handling against the
/// in-memory broker and store, with `sh` standing in for the toolchains:
/// 1. Successful run walks Queued -> Running -> Completed
/// 2. A deadline ends in Timeout and is never retried
/// 3. Admission denial leaves the record Queued and schedules a short retry
/// 4. Decode and launch failures fail the record and use the default curve
/// 5. Redelivery after completion does not touch stored output
/// 6. A store error leaves the record for the retry to run again

#[cfg(all(test, unix))]
mod pipeline {
    use crate::admission::{AdmissionConfig, AdmissionController};
    use crate::config::LanguageConfigManager;
    use crate::error::TaskError;
    use crate::processor::TaskProcessor;
    use crate::runner::Runner;
    use crate::server::Server;
    use crate::testing::{message, shell_runtimes, MemoryBroker, MemoryStore};
    use coderun_common::queue::Broker;
    use coderun_common::tasks::{new_compile_task, Task, TYPE_COMPILE_PYTHON};
    use coderun_common::types::ExecutionStatus::{self, *};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        broker: Arc<MemoryBroker>,
        server: Arc<Server>,
        processor: Arc<TaskProcessor>,
    }

    fn harness_with(runtimes: LanguageConfigManager, admission: AdmissionConfig) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let broker = Arc::new(MemoryBroker::default());
        let processor = Arc::new(TaskProcessor::new(
            store.clone(),
            Arc::new(AdmissionController::new(admission)),
            Arc::new(Runner::new(runtimes)),
        ));
        let server = Arc::new(Server::new(
            broker.clone(),
            processor.clone(),
            2,
            Duration::from_millis(10),
        ));
        Harness {
            store,
            broker,
            server,
            processor,
        }
    }

    fn harness() -> Harness {
        harness_with(shell_runtimes(), AdmissionConfig::default())
    }

    fn exhausted() -> AdmissionConfig {
        AdmissionConfig {
            burst: 0,
            refill_per_sec: 0.0,
            max_jitter: Duration::from_secs(10),
        }
    }

    /// Create the queued record and hand one delivery to the server.
    async fn submit(h: &Harness, language: &str, source: &str, timeout: Duration, max_retry: u32) -> Uuid {
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        let task = new_compile_task(id, language, source).unwrap();
        h.broker.push(message(task, timeout, max_retry));
        let delivery = h.broker.dequeue().await.unwrap().unwrap();
        h.server.handle(delivery).await;
        id
    }

    fn assert_forward_only(history: &[ExecutionStatus]) {
        assert_eq!(history.first(), Some(&Queued));
        for pair in history.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", history);
        }
    }

    #[tokio::test]
    async fn test_completed_run() {
        let h = harness();
        let id = submit(&h, "python", "echo hi", Duration::from_secs(10), 3).await;

        assert_eq!(h.store.history(id), vec![Queued, Running, Completed]);
        let record = h.store.record(id);
        assert_eq!(record.stdout.as_deref(), Some("hi\n"));
        assert_eq!(record.stderr.as_deref(), Some(""));
        assert!(record.execution_time_ms.unwrap() >= 0);

        assert_eq!(*h.broker.acked.lock().unwrap(), vec![id]);
        assert!(h.broker.retried.lock().unwrap().is_empty());
        assert!(h.broker.archived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_error_still_completes() {
        let h = harness();
        let id = submit(&h, "python", "echo boom >&2; exit 1", Duration::from_secs(10), 3).await;

        assert_eq!(h.store.history(id), vec![Queued, Running, Completed]);
        assert_eq!(h.store.record(id).stderr.as_deref(), Some("boom\n"));
        assert_eq!(h.broker.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_based_runtime_completes() {
        let h = harness();
        let id = submit(&h, "go", "echo from file", Duration::from_secs(10), 3).await;

        assert_eq!(h.store.history(id), vec![Queued, Running, Completed]);
        assert_eq!(h.store.record(id).stdout.as_deref(), Some("from file\n"));
    }

    #[tokio::test]
    async fn test_timeout_is_terminal_and_not_retried() {
        let h = harness();
        let id = submit(&h, "go", "while :; do :; done", Duration::from_secs(2), 5).await;

        assert_eq!(h.store.history(id), vec![Queued, Running, Timeout]);
        let record = h.store.record(id);
        assert_eq!(record.stdout, None);

        assert!(h.broker.acked.lock().unwrap().is_empty());
        assert!(h.broker.retried.lock().unwrap().is_empty());
        let archived = h.broker.archived.lock().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].retried, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness();
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        let task = new_compile_task(id, "python", "sleep 30").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.processor.process(&task, cancel).await.unwrap_err();

        assert!(matches!(err, TaskError::Timeout));
        let history = h.store.history(id);
        assert_eq!(history.last(), Some(&Timeout));
        assert_forward_only(&history);
    }

    #[tokio::test]
    async fn test_admission_denied_leaves_record_queued() {
        let h = harness_with(shell_runtimes(), exhausted());
        let id = submit(&h, "python", "echo hi", Duration::from_secs(10), 3).await;

        assert_eq!(h.store.history(id), vec![Queued]);
        assert_eq!(h.store.record(id).status, Queued);

        let retried = h.broker.retried.lock().unwrap();
        assert_eq!(retried.len(), 1);
        let (next, delay) = &retried[0];
        assert!(*delay < Duration::from_secs(10));
        assert_eq!(next.retried, 1);
        assert!(next.last_error.as_deref().unwrap().contains("rate limited"));
        assert!(h.broker.archived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_denied_then_admitted() {
        let store = Arc::new(MemoryStore::default());
        let runner = Arc::new(Runner::new(shell_runtimes()));
        let id = Uuid::new_v4();
        store.insert_queued(id);
        let task = new_compile_task(id, "python", "echo later").unwrap();

        let gated = TaskProcessor::new(
            store.clone(),
            Arc::new(AdmissionController::new(exhausted())),
            runner.clone(),
        );
        let err = gated.process(&task, CancellationToken::new()).await.unwrap_err();
        match err {
            TaskError::AdmissionDenied { retry_in } => assert!(retry_in < Duration::from_secs(10)),
            other => panic!("expected admission denial, got {}", other),
        }
        assert_eq!(store.record(id).status, Queued);

        let open = TaskProcessor::new(
            store.clone(),
            Arc::new(AdmissionController::new(AdmissionConfig::default())),
            runner,
        );
        open.process(&task, CancellationToken::new()).await.unwrap();
        assert_eq!(store.history(id), vec![Queued, Running, Completed]);
        assert_eq!(store.record(id).stdout.as_deref(), Some("later\n"));
    }

    #[tokio::test]
    async fn test_denials_spend_retry_budget() {
        let h = harness_with(shell_runtimes(), exhausted());
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        let task = new_compile_task(id, "python", "echo hi").unwrap();
        let mut last_try = message(task, Duration::from_secs(10), 2);
        last_try.retried = 2;
        h.broker.push(last_try);

        let delivery = h.broker.dequeue().await.unwrap().unwrap();
        h.server.handle(delivery).await;

        assert!(h.broker.retried.lock().unwrap().is_empty());
        assert_eq!(h.broker.archived.lock().unwrap().len(), 1);
        assert_eq!(h.store.record(id).status, Queued);
    }

    #[tokio::test]
    async fn test_undecodable_task_fails_record() {
        let h = harness();
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        let task = Task {
            id,
            type_tag: TYPE_COMPILE_PYTHON.to_string(),
            payload: "{\"execution_id\": 42".to_string(),
        };
        h.broker.push(message(task, Duration::from_secs(10), 3));
        let delivery = h.broker.dequeue().await.unwrap().unwrap();
        h.server.handle(delivery).await;

        assert_eq!(h.store.history(id), vec![Queued, Failed]);
        let retried = h.broker.retried.lock().unwrap();
        assert_eq!(retried.len(), 1);
        assert!(retried[0].1 >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_launch_failure_fails_record() {
        let runtimes = LanguageConfigManager::from_runtimes(vec![crate::config::LanguageRuntime {
            name: "python".to_string(),
            command: "coderun-definitely-missing-python".to_string(),
            args: vec!["-c".to_string(), "{source}".to_string()],
            source_file: None,
        }])
        .unwrap();
        let h = harness_with(runtimes, AdmissionConfig::default());
        let id = submit(&h, "python", "print(1)", Duration::from_secs(10), 3).await;

        assert_eq!(h.store.history(id), vec![Queued, Running, Failed]);
        assert_eq!(h.store.record(id).stdout, None);
        let retried = h.broker.retried.lock().unwrap();
        assert_eq!(retried.len(), 1);
        assert!(retried[0].1 >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_store_blip_before_running_is_retried() {
        let h = harness();
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        h.store.fail_next(Running);
        let task = new_compile_task(id, "python", "echo after blip").unwrap();
        h.broker.push(message(task, Duration::from_secs(10), 3));

        let delivery = h.broker.dequeue().await.unwrap().unwrap();
        h.server.handle(delivery).await;

        // Record untouched, retry scheduled on the default curve.
        assert_eq!(h.store.history(id), vec![Queued]);
        let (retry, delay) = h.broker.retried.lock().unwrap()[0].clone();
        assert!(delay >= Duration::from_secs(15));
        assert_eq!(retry.retried, 1);

        h.processor
            .process(&retry.task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.store.history(id), vec![Queued, Running, Completed]);
        assert_eq!(h.store.record(id).stdout.as_deref(), Some("after blip\n"));
    }

    #[tokio::test]
    async fn test_store_blip_on_completion_reruns() {
        let h = harness();
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        h.store.fail_next(Completed);
        let task = new_compile_task(id, "python", "echo twice").unwrap();

        let err = h
            .processor
            .process(&task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Persistence(_)));
        assert_eq!(h.store.history(id), vec![Queued, Running]);

        h.processor
            .process(&task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.store.history(id), vec![Queued, Running, Running, Completed]);
        assert_eq!(h.store.record(id).stdout.as_deref(), Some("twice\n"));
    }

    #[tokio::test]
    async fn test_retry_after_failed_is_acked_without_running() {
        let h = harness();
        let id = Uuid::new_v4();
        h.store.insert_queued(id);
        let task = Task {
            id,
            type_tag: TYPE_COMPILE_PYTHON.to_string(),
            payload: "not json".to_string(),
        };
        h.broker.push(message(task, Duration::from_secs(10), 3));
        let delivery = h.broker.dequeue().await.unwrap().unwrap();
        h.server.handle(delivery).await;
        assert_eq!(h.store.history(id), vec![Queued, Failed]);

        // Redeliver a well-formed task for the same, now final, record.
        let (mut retry, _) = h.broker.retried.lock().unwrap()[0].clone();
        retry.task = new_compile_task(id, "python", "echo should not run").unwrap();
        h.broker.push(retry);
        let delivery = h.broker.dequeue().await.unwrap().unwrap();
        h.server.handle(delivery).await;

        assert_eq!(*h.broker.acked.lock().unwrap(), vec![id]);
        assert_eq!(h.store.history(id), vec![Queued, Failed]);
        assert_eq!(h.store.record(id).stdout, None);
    }

    #[tokio::test]
    async fn test_missing_record_is_persistence_error() {
        let h = harness();
        let task = new_compile_task(Uuid::new_v4(), "python", "echo hi").unwrap();
        let err = h
            .processor
            .process(&task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_keeps_output() {
        let h = harness();
        let id = submit(&h, "python", "echo first", Duration::from_secs(10), 3).await;
        let before = h.store.record(id);

        // Same execution id, different source: must not run or overwrite.
        let task = new_compile_task(id, "python", "echo second").unwrap();
        h.processor
            .process(&task, CancellationToken::new())
            .await
            .unwrap();

        let after = h.store.record(id);
        assert_eq!(after.stdout.as_deref(), Some("first\n"));
        assert_eq!(after.stdout, before.stdout);
        assert_eq!(h.store.history(id), vec![Queued, Running, Completed]);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let h = harness();
        let mut ids = Vec::new();
        for n in 0..4 {
            let id = Uuid::new_v4();
            h.store.insert_queued(id);
            let task = new_compile_task(id, "python", &format!("echo {}", n)).unwrap();
            h.broker.push(message(task, Duration::from_secs(10), 3));
            ids.push(id);
        }

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(h.server.clone().run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while h.broker.acked.lock().unwrap().len() < ids.len() {
            assert!(tokio::time::Instant::now() < deadline, "queue not drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        running.await.unwrap();

        for (n, id) in ids.iter().enumerate() {
            assert_eq!(h.store.record(*id).stdout, Some(format!("{}\n", n)));
        }
    }

    #[tokio::test]
    #[ignore] // Requires python3 on the host
    async fn test_python_print_hi() {
        let h = harness_with(LanguageConfigManager::builtin(), AdmissionConfig::default());
        let id = submit(&h, "python", "print(\"hi\")", Duration::from_secs(10), 3).await;

        assert_eq!(h.store.history(id), vec![Queued, Running, Completed]);
        let record = h.store.record(id);
        assert_eq!(record.stdout.as_deref(), Some("hi\n"));
        assert_eq!(record.stderr.as_deref(), Some(""));
    }

    #[tokio::test]
    #[ignore] // Requires the go toolchain on the host
    async fn test_go_infinite_loop_times_out() {
        let h = harness_with(LanguageConfigManager::builtin(), AdmissionConfig::default());
        let source = "package main\n\nfunc main() {\n\tfor {\n\t}\n}\n";
        let id = submit(&h, "go", source, Duration::from_secs(2), 3).await;

        assert_eq!(h.store.record(id).status, Timeout);
        assert!(h.broker.retried.lock().unwrap().is_empty());
        assert_eq!(h.broker.archived.lock().unwrap().len(), 1);
    }
}
