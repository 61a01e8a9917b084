// ABOUTME: Integration tests for the runtime facade
// ABOUTME: Exercises background dispatch, cancellation, introspection and workflow entry points

use std::sync::Arc;
use std::time::Duration;

use taskweave::model::{
    TaskPriority, TaskStatus, TaskTemplate, Workflow, WorkflowStatus, WorkflowStep,
};
use taskweave::{Config, Runtime};

mod common;
use common::{task, ScriptedAgent};

fn runtime(max_concurrent_tasks: usize, resource_monitoring: bool) -> Runtime {
    Runtime::new(Config {
        max_concurrent_tasks,
        resource_monitoring,
        wait_poll_interval: Duration::from_millis(10),
        resource_sample_interval: Duration::from_millis(20),
        ..Config::default()
    })
}

async fn wait_for_status(runtime: &Runtime, task_id: &str, status: TaskStatus) {
    for _ in 0..500 {
        if runtime.task(task_id).await.map(|t| t.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {}", task_id, status);
}

#[tokio::test]
async fn test_dispatcher_drains_queue_within_concurrency_limit() {
    let runtime = runtime(2, false);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_millis(20)));
    runtime.register_agent("worker", "scripted", ["*"], agent.clone());
    runtime.start().unwrap();

    for i in 0..6 {
        runtime.submit_task(task(&format!("job-{}", i))).await.unwrap();
    }
    for i in 0..6 {
        wait_for_status(&runtime, &format!("job-{}", i), TaskStatus::Completed).await;
    }

    assert_eq!(agent.calls(), 6);
    assert!(agent.peak_concurrency() <= 2);
    runtime.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_tasks_wait_for_an_agent_to_appear() {
    let runtime = runtime(2, false);
    runtime.start().unwrap();

    runtime.submit_task(task("patient")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = runtime.task("patient").await.unwrap().status;
    assert!(matches!(status, TaskStatus::Pending | TaskStatus::Ready));

    let agent = Arc::new(ScriptedAgent::new());
    runtime.register_agent("late", "scripted", ["work"], agent.clone());
    wait_for_status(&runtime, "patient", TaskStatus::Completed).await;
    assert_eq!(agent.calls(), 1);

    runtime.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_cancel_task_before_and_during_execution() {
    let runtime = runtime(1, false);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_secs(30)));
    runtime.register_agent("worker", "scripted", ["*"], agent.clone());

    runtime.submit_task(task("queued")).await.unwrap();
    assert!(runtime.cancel_task("queued", "not needed").await.unwrap());
    assert_eq!(
        runtime.task("queued").await.unwrap().status,
        TaskStatus::Cancelled
    );

    runtime
        .submit_task(task("running").with_priority(TaskPriority::High))
        .await
        .unwrap();
    runtime.start().unwrap();
    wait_for_status(&runtime, "running", TaskStatus::Running).await;

    assert!(runtime.cancel_task("running", "operator").await.unwrap());
    wait_for_status(&runtime, "running", TaskStatus::Cancelled).await;
    assert_eq!(agent.calls(), 1);

    runtime.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_introspection_over_submitted_tasks() {
    let runtime = runtime(2, false);
    runtime.submit_task(task("T1")).await.unwrap();
    runtime
        .submit_task(task("T2").with_dependency("T1"))
        .await
        .unwrap();
    runtime
        .submit_task(task("T3").with_dependency("T1"))
        .await
        .unwrap();

    let order = runtime.execution_order(None).await.unwrap();
    assert_eq!(order[0], "T1");

    let plan = runtime.optimize_execution_plan(None).await.unwrap();
    assert_eq!(plan.execution_depth(), 2);
    assert_eq!(runtime.dependency_graph().await.edges.len(), 2);

    let status = runtime.status().await;
    assert_eq!(status["queued"], serde_json::json!(3));
    assert_eq!(status["running"], serde_json::json!(false));
}

#[tokio::test]
async fn test_workflow_through_runtime_with_resource_monitoring() {
    let runtime = runtime(4, true);
    let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_millis(60)));
    runtime.register_agent("worker", "scripted", ["*"], agent.clone());
    runtime.start().unwrap();

    let workflow = Workflow::new("monitored")
        .with_step(WorkflowStep::task("first", TaskTemplate::new("first", "work")))
        .with_step(
            WorkflowStep::task("second", TaskTemplate::new("second", "work")).depends_on("first"),
        );
    let workflow_id = workflow.id.clone();

    let finished = runtime.execute_workflow(workflow).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.started(), vec!["first", "second"]);
    assert_eq!(
        runtime.workflow_status(&workflow_id).await.unwrap().status,
        WorkflowStatus::Completed
    );
    assert!(runtime.create_checkpoint(&workflow_id).await.is_ok());

    runtime.shutdown(Duration::from_secs(1)).await.unwrap();
}
