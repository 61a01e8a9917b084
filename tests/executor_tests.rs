// ABOUTME: Integration tests for the task executor
// ABOUTME: Covers the global concurrency bound, retry backoff, timeouts, cancellation and batches

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use taskweave::engine::{BlockingAgent, EngineError};
use taskweave::model::{ExecutionStatus, TaskStatus};

mod common;
use common::{engine, register, task, ScriptedAgent};

#[tokio::test(start_paused = true)]
async fn test_never_more_than_k_running() {
    let (scheduler, executor) = engine(3);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_millis(50)));
    register(&scheduler, "worker", Arc::clone(&agent));

    let tasks = (0..12).map(|i| task(&format!("job-{}", i))).collect();
    let executions = executor.execute_batch(tasks, None).await;

    assert_eq!(executions.len(), 12);
    assert!(executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Completed));
    assert_eq!(agent.calls(), 12);
    assert!(agent.peak_concurrency() <= 3);
    assert_eq!(agent.peak_concurrency(), 3);
    assert_eq!(executor.stats().active_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_task_retries_with_exponential_backoff() {
    let (scheduler, executor) = engine(2);
    let agent = Arc::new(ScriptedAgent::new().always_failing());
    register(&scheduler, "flaky", Arc::clone(&agent));

    let delay = Duration::from_secs(1);
    let execution = executor
        .execute_with_retries(task("unlucky").with_retries(3, delay), None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(agent.calls(), 4);

    let history = executor.executions("unlucky");
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert_eq!(
        history.iter().map(|e| e.execution_number).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );

    let starts = agent.start_times();
    for (i, pair) in starts.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let expected = delay * 2u32.pow(i as u32);
        assert!(gap >= expected, "gap {} was {:?}", i, gap);
        assert!(gap < expected + Duration::from_millis(100), "gap {} was {:?}", i, gap);
    }

    let stored = scheduler.task("unlucky").await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert!(stored.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failure() {
    let (scheduler, executor) = engine(1);
    let agent = Arc::new(ScriptedAgent::new().failing_first(2));
    register(&scheduler, "worker", Arc::clone(&agent));

    let execution = executor
        .execute_with_retries(task("eventually").with_retries(3, Duration::from_millis(10)), None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.execution_number, 3);
    assert_eq!(execution.result, Some(json!({ "task": "eventually", "attempt": 3 })));
    assert_eq!(
        scheduler.task("eventually").await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let (scheduler, executor) = engine(1);
    let agent = Arc::new(ScriptedAgent::new().always_failing().non_retryable());
    register(&scheduler, "worker", Arc::clone(&agent));

    let execution = executor
        .execute_with_retries(task("broken").with_retries(5, Duration::from_millis(1)), None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(agent.calls(), 1);
    assert!(!execution.error.unwrap().retryable);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_wins_over_slow_agent() {
    let (scheduler, executor) = engine(1);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_secs(60)));
    register(&scheduler, "sloth", Arc::clone(&agent));

    let execution = executor
        .execute(
            task("slow")
                .with_retries(0, Duration::from_millis(1))
                .with_timeout(Duration::from_millis(100)),
            None,
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(agent.finished_at("slow").is_none());
    assert_eq!(scheduler.task("slow").await.unwrap().status, TaskStatus::Failed);
    assert!(!executor.is_running("slow"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_execution() {
    let (scheduler, executor) = engine(1);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_secs(30)));
    register(&scheduler, "worker", Arc::clone(&agent));

    let handle = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(task("long"), None).await })
    };

    while agent.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(executor.is_running("long"));
    assert!(executor.cancel("long", "operator request"));

    let execution = handle.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(
        execution.error.map(|e| e.message),
        Some("operator request".to_string())
    );
    assert_eq!(scheduler.task("long").await.unwrap().status, TaskStatus::Cancelled);
    assert!(!executor.cancel("long", "again"));
}

#[tokio::test(start_paused = true)]
async fn test_background_retry_requeues_task() {
    let (scheduler, executor) = engine(1);
    let agent = Arc::new(ScriptedAgent::new().failing_first(1));
    register(&scheduler, "worker", Arc::clone(&agent));

    let first = executor
        .execute(task("bounce").with_retries(2, Duration::from_secs(1)), None)
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(
        scheduler.task("bounce").await.unwrap().status,
        TaskStatus::Retrying
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let requeued = scheduler.get_next_task(None).await.unwrap();
    assert_eq!(requeued.id, "bounce");

    let second = executor.execute_id("bounce", None).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(second.execution_number, 2);
}

#[tokio::test]
async fn test_blocking_agent_runs_off_the_async_threads() {
    let (scheduler, executor) = engine(2);
    scheduler.register_agent(
        "sync",
        "blocking",
        ["hash"],
        Arc::new(BlockingAgent::new(|task, _ctx| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(json!({ "len": task.name.len() }))
        })),
    );

    let mut job = task("digest");
    job.task_type = "hash".to_string();
    let execution = executor.execute(job, Some("sync")).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!({ "len": 6 })));
    assert_eq!(execution.executor_type, "blocking");
}

#[tokio::test]
async fn test_unknown_or_incapable_agent_is_unavailable() {
    let (scheduler, executor) = engine(1);
    scheduler.register_agent(
        "narrow",
        "special",
        ["render"],
        Arc::new(ScriptedAgent::new()),
    );

    let err = executor.execute(task("plain"), None).await.unwrap_err();
    assert!(matches!(err, EngineError::AgentUnavailable { .. }));

    let err = executor.execute_id("plain", Some("narrow")).await.unwrap_err();
    assert!(matches!(err, EngineError::AgentUnavailable { .. }));

    let err = executor.execute_id("plain", Some("ghost")).await.unwrap_err();
    assert!(matches!(err, EngineError::AgentUnavailable { .. }));
}

#[tokio::test]
async fn test_agent_statistics_track_outcomes() {
    let (scheduler, executor) = engine(2);
    let agent = Arc::new(ScriptedAgent::new().failing_first(1).non_retryable());
    register(&scheduler, "worker", agent);

    executor.execute(task("first"), None).await.unwrap();
    executor.execute(task("second"), None).await.unwrap();

    let stats = executor.agent_statistics();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total_executions, 2);
    assert_eq!(stats[0].succeeded, 1);
    assert_eq!(stats[0].failed, 1);
    assert!((stats[0].success_rate - 50.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_same_task_runs_once_while_waiting_for_a_permit() {
    let (scheduler, executor) = engine(2);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_millis(50)));
    register(&scheduler, "worker", Arc::clone(&agent));

    for id in ["blocker-1", "blocker-2", "dup"] {
        scheduler.register_task(task(id)).await.unwrap();
    }
    let blockers: Vec<_> = ["blocker-1", "blocker-2"]
        .into_iter()
        .map(|id| {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute_id(id, None).await })
        })
        .collect();
    while agent.calls() < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let (first, second) = tokio::join!(
        executor.execute_id("dup", None),
        executor.execute_id("dup", None)
    );
    for blocker in blockers {
        blocker.await.unwrap().unwrap();
    }

    let (ran, refused) = match (first, second) {
        (Ok(execution), Err(err)) | (Err(err), Ok(execution)) => (execution, err),
        other => panic!("expected exactly one attempt to run, got {:?}", other),
    };
    assert_eq!(ran.status, ExecutionStatus::Completed);
    assert_eq!(ran.execution_number, 1);
    assert!(matches!(refused, EngineError::Validation { .. }));
    assert_eq!(agent.calls(), 3);
    assert_eq!(executor.executions("dup").len(), 1);
}

#[tokio::test]
async fn test_attempt_refused_after_shutdown_releases_agent() {
    let (scheduler, executor) = engine(1);
    register(&scheduler, "worker", Arc::new(ScriptedAgent::new()));
    executor.shutdown(Duration::from_secs(1)).await.unwrap();

    let err = executor.execute(task("late"), None).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { .. }));

    assert_eq!(scheduler.agents().workload("worker"), Some(0));
    let late = scheduler.task("late").await.unwrap();
    assert!(late.assigned_to.is_none());
    assert_eq!(late.status, TaskStatus::Pending);
    assert!(!executor.is_running("late"));
}
