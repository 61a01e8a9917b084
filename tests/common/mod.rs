// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides scripted agents that record calls and concurrency plus engine builders

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use taskweave::engine::{
    AgentError, AgentExecutor, AgentRegistry, DependencyResolver, ExecutionContext, TaskExecutor,
    TaskScheduler,
};
use taskweave::model::Task;

/// Agent whose behaviour is configured up front and whose calls are observable
pub struct ScriptedAgent {
    delay: Duration,
    fail_first: usize,
    retryable: bool,
    calls: AtomicUsize,
    current: Arc<AtomicUsize>,
    peak: AtomicUsize,
    starts: Mutex<Vec<(String, Instant)>>,
    finishes: Mutex<Vec<(String, Instant)>>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_first: 0,
            retryable: true,
            calls: AtomicUsize::new(0),
            current: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            finishes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` calls
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_first(usize::MAX)
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.starts.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn started_at(&self, name: &str) -> Option<Instant> {
        self.starts
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, at)| *at)
    }

    pub fn finished_at(&self, name: &str) -> Option<Instant> {
        self.finishes
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(&self, task: Task, ctx: ExecutionContext) -> Result<Value, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(Arc::clone(&self.current));
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        self.starts.lock().push((task.name.clone(), Instant::now()));

        // per-task overrides carried in metadata
        let delay = task
            .metadata
            .get_i64("delay_ms")
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.finishes.lock().push((task.name.clone(), Instant::now()));

        if task.metadata.get_bool("fail") == Some(true) {
            return Err(AgentError::fatal(format!("{} was told to fail", task.name)));
        }
        if let Some(variables) = task.metadata.get("variables") {
            return Ok(json!({ "task": task.name, "variables": variables }));
        }

        if call < self.fail_first {
            let message = format!("scripted failure {} of {}", call + 1, task.name);
            return Err(if self.retryable {
                AgentError::retryable(message)
            } else {
                AgentError::fatal(message)
            });
        }

        Ok(json!({ "task": task.name, "attempt": ctx.attempt }))
    }
}

/// Scheduler plus executor sharing one registry and agent pool
pub fn engine(max_concurrent: usize) -> (Arc<TaskScheduler>, Arc<TaskExecutor>) {
    let scheduler = Arc::new(TaskScheduler::new(
        Arc::new(RwLock::new(DependencyResolver::new())),
        Arc::new(AgentRegistry::new()),
    ));
    let executor = Arc::new(TaskExecutor::new(Arc::clone(&scheduler), max_concurrent));
    (scheduler, executor)
}

pub fn register(scheduler: &TaskScheduler, id: &str, agent: Arc<ScriptedAgent>) {
    scheduler.register_agent(id, "scripted", ["*"], agent);
}

pub fn task(id: &str) -> Task {
    Task::new(id, "work").with_id(id)
}
