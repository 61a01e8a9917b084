// ABOUTME: Agent executor trait, closure adapters and the agent registry
// ABOUTME: Agents advertise capabilities and carry a workload counter used for load balancing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use super::context::ExecutionContext;
use super::error::AgentError;
use crate::model::Task;

/// Capability that matches every task type
pub const WILDCARD_CAPABILITY: &str = "*";

/// Something that can run a task and produce a JSON result
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, task: Task, ctx: ExecutionContext) -> Result<Value, AgentError>;
}

/// Adapter turning an async closure into an agent
pub struct FnAgent<F> {
    func: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> AgentExecutor for FnAgent<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    async fn execute(&self, task: Task, ctx: ExecutionContext) -> Result<Value, AgentError> {
        (self.func)(task, ctx).await
    }
}

/// Adapter running a synchronous closure on the blocking thread pool
pub struct BlockingAgent<F> {
    func: Arc<F>,
}

impl<F> BlockingAgent<F>
where
    F: Fn(Task, ExecutionContext) -> Result<Value, AgentError> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> AgentExecutor for BlockingAgent<F>
where
    F: Fn(Task, ExecutionContext) -> Result<Value, AgentError> + Send + Sync + 'static,
{
    async fn execute(&self, task: Task, ctx: ExecutionContext) -> Result<Value, AgentError> {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(task, ctx))
            .await
            .map_err(|e| AgentError::fatal(format!("blocking agent panicked: {}", e)))?
    }
}

struct AgentEntry {
    agent_type: String,
    capabilities: HashSet<String>,
    executor: Arc<dyn AgentExecutor>,
    workload: usize,
    registered_at: DateTime<Utc>,
}

impl AgentEntry {
    fn handles(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type) || self.capabilities.contains(WILDCARD_CAPABILITY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub workload: usize,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent; a replaced agent keeps its workload
    pub fn register<I, S>(
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
        let mut agents = self.agents.write();
        let workload = agents.get(&agent_id).map(|a| a.workload).unwrap_or(0);

        agents.insert(
            agent_id,
            AgentEntry {
                agent_type: agent_type.into(),
                capabilities: capabilities.into_iter().map(Into::into).collect(),
                executor,
                workload,
                registered_at: Utc::now(),
            },
        );
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.agents.write().remove(agent_id).is_some()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn can_handle(&self, agent_id: &str, task_type: &str) -> bool {
        self.agents
            .read()
            .get(agent_id)
            .is_some_and(|a| a.handles(task_type))
    }

    /// Capable agent with the lowest workload; ties go to the smallest id
    pub fn least_loaded(&self, task_type: &str) -> Option<String> {
        self.agents
            .read()
            .iter()
            .filter(|(_, agent)| agent.handles(task_type))
            .min_by(|(a_id, a), (b_id, b)| a.workload.cmp(&b.workload).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone())
    }

    pub fn executor(&self, agent_id: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.agents
            .read()
            .get(agent_id)
            .map(|a| Arc::clone(&a.executor))
    }

    pub fn agent_type(&self, agent_id: &str) -> Option<String> {
        self.agents.read().get(agent_id).map(|a| a.agent_type.clone())
    }

    pub fn increment_workload(&self, agent_id: &str) {
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.workload += 1;
        }
    }

    pub fn decrement_workload(&self, agent_id: &str) {
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.workload = agent.workload.saturating_sub(1);
        }
    }

    pub fn workload(&self, agent_id: &str) -> Option<usize> {
        self.agents.read().get(agent_id).map(|a| a.workload)
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents
            .read()
            .get(agent_id)
            .map(|entry| Self::info(agent_id, entry))
    }

    /// Snapshot of all agents sorted by id
    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .read()
            .iter()
            .map(|(id, entry)| Self::info(id, entry))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    fn info(id: &str, entry: &AgentEntry) -> AgentInfo {
        let mut capabilities: Vec<String> = entry.capabilities.iter().cloned().collect();
        capabilities.sort();
        AgentInfo {
            id: id.to_string(),
            agent_type: entry.agent_type.clone(),
            capabilities,
            workload: entry.workload,
            registered_at: entry.registered_at,
        }
    }
}
