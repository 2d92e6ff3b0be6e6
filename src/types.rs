//! Core data model: service instances and the task/result shapes that flow
//! through the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CoreError, Component};

/// A logical backend registered with the [`Registry`](crate::registry::Registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub endpoint: String,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub healthy: bool,
}

impl ServiceInstance {
    /// Builds a new instance with `registered_at == last_seen == now` and
    /// `healthy = true`, as `Registry::register` requires. Returns
    /// `InvalidInput` if any required field is empty.
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let id = id.into();
        let service_name = service_name.into();
        let endpoint = endpoint.into();

        if id.is_empty() {
            return Err(CoreError::invalid_input(Component::Registry, "register", "id"));
        }
        if service_name.is_empty() {
            return Err(CoreError::invalid_input(
                Component::Registry,
                "register",
                "service_name",
            ));
        }
        if endpoint.is_empty() {
            return Err(CoreError::invalid_input(
                Component::Registry,
                "register",
                "endpoint",
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id,
            service_name,
            endpoint,
            agents: Vec::new(),
            metadata: HashMap::new(),
            registered_at: now,
            last_seen: now,
            healthy: true,
        })
    }

    pub fn with_agents(mut self, agents: Vec<String>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Opaque-to-the-core agent input. `context` may be mutated by sequential
/// (pipeline) execution to carry the previous task's output forward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInput {
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl AgentInput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            context: HashMap::new(),
        }
    }
}

/// Opaque-to-the-core agent output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A single unit of work: which service, which agent, with what input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub service_name: String,
    pub agent_name: String,
    pub input: AgentInput,
}

impl AgentTask {
    pub fn new(
        service_name: impl Into<String>,
        agent_name: impl Into<String>,
        input: AgentInput,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            agent_name: agent_name.into(),
            input,
        }
    }
}

/// The result of running one [`AgentTask`]: the task itself, plus either an
/// output or a structured error. Batch drivers preserve input ordering by
/// index, not completion order.
#[derive(Debug, Clone)]
pub struct AgentTaskResult {
    pub task: AgentTask,
    pub outcome: Result<AgentOutput, CoreError>,
}

impl AgentTaskResult {
    pub fn success(task: AgentTask, output: AgentOutput) -> Self {
        Self {
            task,
            outcome: Ok(output),
        }
    }

    pub fn failure(task: AgentTask, error: CoreError) -> Self {
        Self {
            task,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}
