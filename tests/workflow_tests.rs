// ABOUTME: Integration tests for workflow orchestration on top of the executor
// ABOUTME: Covers step ordering, failure policy, control-flow steps, pause/resume/cancel and checkpoints

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use taskweave::engine::EngineError;
use taskweave::model::{
    Condition, ConditionOperator, ConditionSource, TaskStatus, TaskTemplate, Workflow,
    WorkflowStatus, WorkflowStep,
};
use taskweave::workflow::{OrchestratorConfig, WorkflowCheckpoint, WorkflowOrchestrator};

mod common;
use common::{engine, register, ScriptedAgent};

fn setup(max_workflows: usize) -> (Arc<WorkflowOrchestrator>, Arc<ScriptedAgent>) {
    let (scheduler, executor) = engine(4);
    let agent = Arc::new(ScriptedAgent::new());
    register(&scheduler, "worker", Arc::clone(&agent));

    let orchestrator = WorkflowOrchestrator::new(
        executor,
        OrchestratorConfig {
            max_concurrent_workflows: max_workflows,
            wait_poll_interval: Duration::from_millis(10),
            auto_checkpoint: true,
        },
    );
    (Arc::new(orchestrator), agent)
}

fn step(id: &str) -> WorkflowStep {
    WorkflowStep::task(id, TaskTemplate::new(id, "work"))
}

fn slow_step(id: &str, delay_ms: i64) -> WorkflowStep {
    WorkflowStep::task(id, TaskTemplate::new(id, "work").with_metadata("delay_ms", delay_ms))
}

fn failing_step(id: &str) -> WorkflowStep {
    WorkflowStep::task(id, TaskTemplate::new(id, "work").with_metadata("fail", true))
}

async fn wait_for_calls(agent: &ScriptedAgent, calls: usize) {
    while agent.calls() < calls {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dependent_step_waits_for_completion() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("build")
        .with_step(step("B").depends_on("A"))
        .with_step(slow_step("A", 50));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.started(), vec!["A", "B"]);
    assert!(agent.started_at("B").unwrap() >= agent.finished_at("A").unwrap());
    assert!(finished.checkpoint_data.is_some());
    assert!(finished.completed_at.is_some());
}

#[tokio::test]
async fn test_failed_step_fails_workflow_and_dependent_never_starts() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("release")
        .with_step(failing_step("A"))
        .with_step(step("B").depends_on("A"));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Failed);
    assert_eq!(finished.step("A").unwrap().status, TaskStatus::Failed);
    assert_eq!(finished.step("B").unwrap().status, TaskStatus::Pending);
    assert!(finished.step("B").unwrap().started_at.is_none());
    assert_eq!(agent.started(), vec!["A"]);
    assert!(finished.error.unwrap().contains("'A'"));
}

#[tokio::test]
async fn test_skipped_failure_lets_dependents_run() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("lenient")
        .with_step(failing_step("optional").skip_on_failure())
        .with_step(step("main").depends_on("optional"));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.step("optional").unwrap().status, TaskStatus::Failed);
    assert_eq!(finished.step("main").unwrap().status, TaskStatus::Completed);
    assert_eq!(agent.calls(), 2);
}

#[tokio::test]
async fn test_always_true_loop_stops_at_max_iterations() {
    let (orchestrator, agent) = setup(5);
    let forever = Condition::new(ConditionSource::Variables, "forever", ConditionOperator::Exists, None);
    let workflow = Workflow::new("spin")
        .with_variable("forever", true)
        .with_step(WorkflowStep::looping("spin", forever, vec![step("tick")], 5));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.calls(), 5);
    let result = finished.step("spin").unwrap().result.clone().unwrap();
    assert_eq!(result["iterations"], json!(5));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_step_runs_children_concurrently() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("fan").with_step(WorkflowStep::parallel(
        "fan",
        vec![slow_step("a", 50), slow_step("b", 50), slow_step("c", 50)],
    ));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.peak_concurrency(), 3);
    let result = finished.step("fan").unwrap().result.clone().unwrap();
    assert_eq!(result.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_sequential_step_skips_tolerated_failure() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("seq").with_step(WorkflowStep::sequential(
        "chain",
        vec![failing_step("flaky").skip_on_failure(), step("after")],
    ));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.started(), vec!["flaky", "after"]);
}

#[tokio::test]
async fn test_conditional_branches_on_last_result() {
    let (orchestrator, agent) = setup(5);
    let gate = Condition::new(
        ConditionSource::Result,
        "task",
        ConditionOperator::Equals,
        Some(json!("build")),
    );
    let workflow = Workflow::new("gated")
        .with_step(step("build"))
        .with_step(
            WorkflowStep::conditional("gate", gate, vec![step("deploy")], vec![step("rollback")])
                .depends_on("build"),
        );

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.started(), vec!["build", "deploy"]);
    let result = finished.step("gate").unwrap().result.clone().unwrap();
    assert_eq!(result["branch"], json!(true));
}

#[tokio::test]
async fn test_task_results_feed_variables_and_templates() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("versioned")
        .with_step(WorkflowStep::task(
            "stamp",
            TaskTemplate::new("stamp", "work").with_metadata("variables", json!({ "version": "1.2" })),
        ))
        .with_step(
            WorkflowStep::task("publish", TaskTemplate::new("publish-{{version}}", "work"))
                .depends_on("stamp"),
        );

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.variables.get_str("version"), Some("1.2"));
    assert_eq!(agent.started(), vec!["stamp", "publish-1.2"]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_steps_sleep_or_time_out() {
    let (orchestrator, agent) = setup(5);
    let started = Instant::now();
    let workflow = Workflow::new("patient")
        .with_step(WorkflowStep::wait("cool-down", Some(2.0), None))
        .with_step(step("after").depends_on("cool-down"));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert!(agent.started_at("after").unwrap() - started >= Duration::from_secs(2));

    let never = Condition::new(ConditionSource::Variables, "ready", ConditionOperator::Exists, None);
    let workflow = Workflow::new("stuck").with_step(WorkflowStep::wait("gate", Some(1.0), Some(never)));
    let finished = orchestrator.execute_workflow(workflow).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Failed);
    assert!(finished
        .step("gate")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("not met"));
}

#[tokio::test(start_paused = true)]
async fn test_pause_then_resume_completes() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("pausable")
        .with_step(slow_step("A", 10_000))
        .with_step(step("B").depends_on("A"));
    let workflow_id = workflow.id.clone();

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.execute_workflow(workflow).await })
    };
    wait_for_calls(&agent, 1).await;
    orchestrator.pause_workflow(&workflow_id).await.unwrap();

    let paused = running.await.unwrap().unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.step("A").unwrap().status, TaskStatus::Pending);
    assert_eq!(paused.step("B").unwrap().status, TaskStatus::Pending);
    assert_eq!(orchestrator.active_workflows(), 0);

    let resumed = orchestrator.resume_workflow(&workflow_id).await.unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Completed);
    assert_eq!(agent.started(), vec!["A", "A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_terminal() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("doomed")
        .with_step(slow_step("A", 10_000))
        .with_step(step("B").depends_on("A"));
    let workflow_id = workflow.id.clone();

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.execute_workflow(workflow).await })
    };
    wait_for_calls(&agent, 1).await;
    orchestrator.cancel_workflow(&workflow_id).await.unwrap();

    let cancelled = running.await.unwrap().unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(cancelled.step("A").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(cancelled.step("B").unwrap().status, TaskStatus::Cancelled);
    assert!(orchestrator.resume_workflow(&workflow_id).await.is_err());
    assert_eq!(
        orchestrator.workflow_status(&workflow_id).await.unwrap().status,
        WorkflowStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_workflow_limit() {
    let (orchestrator, agent) = setup(1);
    let first = Workflow::new("first").with_step(slow_step("long", 10_000));
    let first_id = first.id.clone();

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.execute_workflow(first).await })
    };
    wait_for_calls(&agent, 1).await;

    let second = Workflow::new("second").with_step(step("quick"));
    let err = orchestrator.execute_workflow(second).await.unwrap_err();
    assert!(matches!(err, EngineError::Capacity { limit: 1, .. }));

    orchestrator.cancel_workflow(&first_id).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cyclic_steps_rejected_up_front() {
    let (orchestrator, agent) = setup(5);
    let workflow = Workflow::new("loop")
        .with_step(step("a").depends_on("b"))
        .with_step(step("b").depends_on("a"));

    let err = orchestrator.execute_workflow(workflow).await.unwrap_err();
    assert!(matches!(err, EngineError::CircularDependency { .. }));
    assert_eq!(agent.calls(), 0);
}

fn two_stage(id: &str) -> Workflow {
    let mut workflow = Workflow::new("two-stage")
        .with_context("requested_by", "ci")
        .with_step(step("A"))
        .with_step(slow_step("B", 10_000).depends_on("A"));
    workflow.id = id.to_string();
    workflow
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_restore_round_trip_and_resume() {
    let (orchestrator, agent) = setup(5);
    let workflow = two_stage("wf-checkpoint");

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.execute_workflow(workflow).await })
    };
    wait_for_calls(&agent, 2).await;
    orchestrator.pause_workflow("wf-checkpoint").await.unwrap();
    let paused = running.await.unwrap().unwrap();
    assert_eq!(paused.step("A").unwrap().status, TaskStatus::Completed);

    let json = orchestrator
        .create_checkpoint("wf-checkpoint")
        .await
        .unwrap()
        .to_json()
        .unwrap();
    let checkpoint = WorkflowCheckpoint::from_json(&json).unwrap();

    let mut fresh = two_stage("wf-checkpoint");
    fresh.restore_from_checkpoint(&checkpoint).unwrap();
    for (before, after) in paused.steps.iter().zip(&fresh.steps) {
        assert_eq!(before.status, after.status);
        assert_eq!(before.result, after.result);
        assert_eq!(before.error, after.error);
    }
    assert_eq!(fresh.context, paused.context);
    assert_eq!(fresh.variables, paused.variables);

    let (restarted, second_agent) = setup(5);
    let id = restarted
        .restore_workflow(two_stage("wf-checkpoint"), &checkpoint)
        .await
        .unwrap();
    let finished = restarted.resume_workflow(&id).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(second_agent.started(), vec!["B"]);
}

#[tokio::test]
async fn test_parallel_step_records_each_child_outcome() {
    let (orchestrator, _agent) = setup(5);
    let workflow = Workflow::new("mixed").with_step(WorkflowStep::parallel(
        "fan",
        vec![
            step("ok"),
            failing_step("tolerated").skip_on_failure(),
            failing_step("broken"),
        ],
    ));
    let workflow_id = workflow.id.clone();

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Failed);

    let fan = finished.step("fan").unwrap();
    assert_eq!(fan.status, TaskStatus::Failed);
    let child = |id: &str| {
        fan.children()
            .into_iter()
            .find(|c| c.id == id)
            .cloned()
            .unwrap()
    };

    let ok = child("ok");
    assert_eq!(ok.status, TaskStatus::Completed);
    assert_eq!(ok.result.unwrap()["task"], json!("ok"));
    assert!(ok.completed_at.is_some());

    let tolerated = child("tolerated");
    assert_eq!(tolerated.status, TaskStatus::Failed);
    assert!(tolerated.error.unwrap().contains("told to fail"));

    let broken = child("broken");
    assert_eq!(broken.status, TaskStatus::Failed);
    assert!(broken.started_at.is_some());

    let checkpoint = orchestrator.create_checkpoint(&workflow_id).await.unwrap();
    let saved = &checkpoint.steps["fan"].sub_steps;
    assert_eq!(saved["ok"].status, TaskStatus::Completed);
    assert_eq!(saved["broken"].status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_finished_loop_leaves_no_tasks_registered() {
    let (scheduler, executor) = engine(4);
    let agent = Arc::new(ScriptedAgent::new());
    register(&scheduler, "worker", Arc::clone(&agent));
    let orchestrator = WorkflowOrchestrator::new(Arc::clone(&executor), OrchestratorConfig::default());

    let forever = Condition::new(ConditionSource::Variables, "forever", ConditionOperator::Exists, None);
    let workflow = Workflow::new("churn")
        .with_variable("forever", true)
        .with_step(WorkflowStep::looping("spin", forever, vec![step("tick")], 20))
        .with_step(step("done").depends_on("spin"));

    let finished = orchestrator.execute_workflow(workflow).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(agent.calls(), 21);
    assert_eq!(scheduler.resolver().read().await.len(), 0);

    let stats = executor.agent_statistics();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total_executions, 21);
}
