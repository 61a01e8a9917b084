// ABOUTME: Priority-queue task scheduler with agent assignment and load balancing
// ABOUTME: Orders tasks by priority, deadline proximity and age, and tracks agent workload

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::{AgentExecutor, AgentInfo, AgentRegistry};
use super::dependency::DependencyResolver;
use super::error::{EngineError, Result};
use crate::model::{Task, TaskStatus};

/// Heap key; the smallest key is dequeued first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    neg_priority: i64,
    deadline_boost: i64,
    created_at: i64,
    task_id: String,
    deadline: Option<DateTime<Utc>>,
}

impl QueueKey {
    fn for_task(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            neg_priority: -task.priority.value(),
            deadline_boost: deadline_boost(task.deadline, now),
            created_at: task.created_at.timestamp_micros(),
            task_id: task.id.clone(),
            deadline: task.deadline,
        }
    }
}

fn deadline_boost(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match deadline {
        Some(deadline) => {
            let remaining = deadline - now;
            if remaining < chrono::Duration::hours(1) {
                -10
            } else if remaining < chrono::Duration::days(1) {
                -5
            } else {
                0
            }
        }
        None => 0,
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<QueueKey>>,
    queued: HashSet<String>,
    // tasks admitted through add_task or requeue; only these get dependents enqueued
    managed: HashSet<String>,
}

impl QueueState {
    fn push(&mut self, key: QueueKey) {
        if self.queued.insert(key.task_id.clone()) {
            self.heap.push(Reverse(key));
        }
    }

    fn pop(&mut self) -> Option<QueueKey> {
        let Reverse(key) = self.heap.pop()?;
        self.queued.remove(&key.task_id);
        Some(key)
    }

    /// Recompute deadline boosts as of `now` and drop entries no longer queued
    fn refresh(&mut self, now: DateTime<Utc>) {
        let mut seen = HashSet::new();
        let keys: Vec<QueueKey> = std::mem::take(&mut self.heap)
            .into_iter()
            .map(|Reverse(key)| key)
            .filter(|key| self.queued.contains(&key.task_id) && seen.insert(key.task_id.clone()))
            .collect();

        self.heap = keys
            .into_iter()
            .map(|mut key| {
                key.deadline_boost = deadline_boost(key.deadline, now);
                Reverse(key)
            })
            .collect();
    }
}

pub struct TaskScheduler {
    resolver: Arc<RwLock<DependencyResolver>>,
    agents: Arc<AgentRegistry>,
    queue: Mutex<QueueState>,
    notify: Notify,
}

impl TaskScheduler {
    pub fn new(resolver: Arc<RwLock<DependencyResolver>>, agents: Arc<AgentRegistry>) -> Self {
        Self {
            resolver,
            agents,
            queue: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<RwLock<DependencyResolver>> {
        &self.resolver
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// Validate and register a task, enqueueing it when PENDING
    pub async fn add_task(&self, task: Task) -> Result<String> {
        let task_id = task.id.clone();
        let key = {
            let mut resolver = self.resolver.write().await;
            Self::check_new_task(&resolver, &task)?;

            let key = (task.status == TaskStatus::Pending).then(|| QueueKey::for_task(&task, Utc::now()));
            resolver.add_task(task);
            key
        };

        let mut queue = self.queue.lock().await;
        queue.managed.insert(task_id.clone());
        if let Some(key) = key {
            queue.push(key);
            drop(queue);
            self.notify.notify_one();
        }

        info!("Task submitted: {}", task_id);
        Ok(task_id)
    }

    /// Register a task without queueing it; the caller drives its execution
    pub async fn register_task(&self, task: Task) -> Result<String> {
        let task_id = task.id.clone();
        let mut resolver = self.resolver.write().await;
        Self::check_new_task(&resolver, &task)?;
        resolver.add_task(task);
        debug!("Task registered: {}", task_id);
        Ok(task_id)
    }

    fn check_new_task(resolver: &DependencyResolver, task: &Task) -> Result<()> {
        if resolver.contains(&task.id) {
            return Err(EngineError::validation(format!(
                "Task '{}' is already registered",
                task.id
            )));
        }
        match resolver.validate_dependencies(task).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn remove_task(&self, task_id: &str) -> Option<Task> {
        let removed = self.resolver.write().await.remove_task(task_id)?;
        if let Some(agent_id) = &removed.assigned_to {
            self.agents.decrement_workload(agent_id);
        }
        Some(removed)
    }

    /// Pop the best ready task, optionally restricted to what `agent_id` can handle
    pub async fn get_next_task(&self, agent_id: Option<&str>) -> Option<Task> {
        let mut queue = self.queue.lock().await;
        let mut resolver = self.resolver.write().await;
        let now = Utc::now();
        queue.refresh(now);
        let mut deferred = Vec::new();
        let mut selected = None;

        while let Some(key) = queue.pop() {
            let Some(task) = resolver.get(&key.task_id) else {
                debug!("Dropping stale queue entry for removed task {}", key.task_id);
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            let not_yet_due = task.scheduled_at.is_some_and(|at| at > now);
            let mismatch = agent_id.is_some_and(|id| !self.agents.can_handle(id, &task.task_type));
            if not_yet_due || mismatch || !resolver.dependencies_satisfied(&key.task_id) {
                deferred.push(key);
                continue;
            }

            selected = Some(key.task_id);
            break;
        }

        for key in deferred {
            queue.push(key);
        }

        let task_id = selected?;
        let task = resolver.get_mut(&task_id)?;
        if let Err(e) = task.transition_to(TaskStatus::Ready) {
            warn!("Failed to mark task {} ready: {}", task_id, e);
            return None;
        }

        if let Some(agent_id) = agent_id {
            if task.assigned_to.as_deref() != Some(agent_id) {
                if let Some(previous) = task.assigned_to.replace(agent_id.to_string()) {
                    self.agents.decrement_workload(&previous);
                }
                self.agents.increment_workload(agent_id);
            }
        }

        debug!("Dequeued task {} for agent {:?}", task_id, agent_id);
        Some(task.clone())
    }

    pub fn register_agent<I, S>(
        &self,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: I,
        executor: Arc<dyn AgentExecutor>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent_id = agent_id.into();
        self.agents
            .register(agent_id.clone(), agent_type, capabilities, executor);
        info!("Agent registered: {}", agent_id);
        self.notify.notify_one();
    }

    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.agents.unregister(agent_id);
        if removed {
            info!("Agent unregistered: {}", agent_id);
        }
        removed
    }

    pub fn least_loaded_agent(&self, task_type: &str) -> Option<String> {
        self.agents.least_loaded(task_type)
    }

    pub fn agent_info(&self) -> Vec<AgentInfo> {
        self.agents.agents()
    }

    /// Bind `task_id` to `agent_id`, moving the workload count from any previous agent
    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let mut resolver = self.resolver.write().await;
        let task = resolver
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        if task.assigned_to.as_deref() == Some(agent_id) {
            return Ok(());
        }
        if let Some(previous) = task.assigned_to.replace(agent_id.to_string()) {
            self.agents.decrement_workload(&previous);
        }
        self.agents.increment_workload(agent_id);
        Ok(())
    }

    /// Drop the agent binding of a task whose attempt never started
    pub async fn release_assignment(&self, task_id: &str) {
        let mut resolver = self.resolver.write().await;
        if let Some(agent_id) = resolver.get_mut(task_id).and_then(|t| t.assigned_to.take()) {
            self.agents.decrement_workload(&agent_id);
            debug!("Released agent {} from task {}", agent_id, task_id);
        }
    }

    /// Move pending assignments off overloaded agents; returns the number moved
    pub async fn rebalance_tasks(&self) -> usize {
        let mut resolver = self.resolver.write().await;
        let agents = self.agents.agents();
        if agents.is_empty() {
            return 0;
        }

        let mut by_agent: HashMap<String, Vec<(i64, i64, String)>> = HashMap::new();
        let mut pending: usize = 0;
        for task in resolver.tasks() {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            if let Some(agent_id) = &task.assigned_to {
                pending += 1;
                by_agent.entry(agent_id.clone()).or_default().push((
                    task.priority.value(),
                    -task.created_at.timestamp_micros(),
                    task.id.clone(),
                ));
            }
        }
        if pending == 0 {
            return 0;
        }

        let target = pending.div_ceil(agents.len());
        let mut moved = 0;

        for agent in &agents {
            let Some(mut owned) = by_agent.remove(&agent.id) else {
                continue;
            };
            // lowest priority first, newest first among equals
            owned.sort();

            for (_, _, task_id) in owned {
                if self.agents.workload(&agent.id).unwrap_or(0) <= target {
                    break;
                }
                let Some(task) = resolver.get_mut(&task_id) else {
                    continue;
                };

                let candidate = agents
                    .iter()
                    .filter(|other| other.id != agent.id)
                    .filter(|other| self.agents.can_handle(&other.id, &task.task_type))
                    .filter_map(|other| {
                        let load = self.agents.workload(&other.id)?;
                        (load < target).then_some((load, other.id.clone()))
                    })
                    .min();

                let Some((_, new_agent)) = candidate else {
                    continue;
                };

                task.assigned_to = Some(new_agent.clone());
                self.agents.decrement_workload(&agent.id);
                self.agents.increment_workload(&new_agent);
                moved += 1;
                debug!("Rebalanced task {} from {} to {}", task_id, agent.id, new_agent);
            }
        }

        if moved > 0 {
            info!("Rebalanced {} task(s) across {} agents", moved, agents.len());
        }
        moved
    }

    /// Apply a status change, releasing agents and enqueueing newly ready dependents
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Vec<String>> {
        let ready_keys = {
            let mut resolver = self.resolver.write().await;
            let task = resolver
                .get_mut(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;

            task.transition_to(status)?;
            if status.releases_agent() {
                if let Some(agent_id) = task.assigned_to.take() {
                    self.agents.decrement_workload(&agent_id);
                }
            }

            if status == TaskStatus::Completed {
                let now = Utc::now();
                resolver
                    .dependents(task_id)
                    .iter()
                    .filter_map(|id| resolver.get(id))
                    .filter(|t| t.status == TaskStatus::Pending)
                    .filter(|t| resolver.dependencies_satisfied(&t.id))
                    .map(|t| QueueKey::for_task(t, now))
                    .collect()
            } else {
                Vec::new()
            }
        };

        if ready_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut queue = self.queue.lock().await;
        let mut enqueued = Vec::new();
        for key in ready_keys {
            if queue.managed.contains(&key.task_id) {
                enqueued.push(key.task_id.clone());
                queue.push(key);
            }
        }
        drop(queue);

        if !enqueued.is_empty() {
            debug!("Task {} unblocked {:?}", task_id, enqueued);
            self.notify.notify_one();
        }
        Ok(enqueued)
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.resolver.read().await.get(task_id).cloned()
    }

    /// Mutate a registered task in place under the registry lock
    pub async fn modify_task<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let mut resolver = self.resolver.write().await;
        let task = resolver
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        Ok(f(task))
    }

    /// Put a PENDING task back in the queue
    pub async fn requeue(&self, task_id: &str) -> Result<()> {
        let key = {
            let resolver = self.resolver.read().await;
            let task = resolver
                .get(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;
            QueueKey::for_task(task, Utc::now())
        };

        let mut queue = self.queue.lock().await;
        queue.managed.insert(task_id.to_string());
        queue.push(key);
        drop(queue);

        self.notify.notify_one();
        Ok(())
    }

    /// Return a dequeued READY task to the queue without waking waiters
    pub async fn defer(&self, task_id: &str) -> Result<()> {
        let key = {
            let mut resolver = self.resolver.write().await;
            let task = resolver
                .get_mut(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;
            if task.status == TaskStatus::Ready {
                task.transition_to(TaskStatus::Pending)?;
            }
            QueueKey::for_task(task, Utc::now())
        };

        self.queue.lock().await.push(key);
        Ok(())
    }

    /// Cancel a task that is not currently running; returns false otherwise
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        {
            let mut resolver = self.resolver.write().await;
            let task = resolver
                .get_mut(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;

            if task.status == TaskStatus::Running || !task.status.can_transition_to(TaskStatus::Cancelled)
            {
                return Ok(false);
            }
            if task.status == TaskStatus::Cancelled {
                return Ok(false);
            }

            task.transition_to(TaskStatus::Cancelled)?;
            if let Some(agent_id) = task.assigned_to.take() {
                self.agents.decrement_workload(&agent_id);
            }
        }

        // the heap entry is dropped on the next refresh
        self.queue.lock().await.queued.remove(task_id);
        info!("Task cancelled before execution: {}", task_id);
        Ok(true)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.queued.len()
    }

    pub async fn pending_tasks(&self) -> Vec<Task> {
        self.resolver
            .read()
            .await
            .tasks()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// Resolves when new work may be available
    pub async fn wait_for_work(&self) {
        self.notify.notified().await
    }

    /// Periodically rebalance until `token` is cancelled
    pub fn spawn_rebalancer(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.rebalance_tasks().await;
                    }
                }
            }
            debug!("Rebalancer stopped");
        })
    }
}
