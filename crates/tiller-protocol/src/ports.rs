//! Boundary ports between the engine and its external collaborators.
//!
//! - [`Agent`] proposes the next action from the current view.
//! - [`Runtime`] executes tool calls in a sandbox.
//! - [`KnowledgeProvider`] supplies trigger-matched content for recalls.
//! - [`TrajectoryStore`] persists finished rollouts.
//!
//! Async ports use `async-trait` for dyn dispatch. Knowledge providers are
//! synchronous and read-only: recall never suspends.

use crate::error::{AgentError, RuntimeError, StoreResult};
use crate::event::{Action, TokenUsage, ToolCall};
use crate::ids::{EventId, RolloutId, TrajectoryId};
use crate::knowledge::KnowledgeFragment;
use crate::trajectory::{Trajectory, TrajectoryQuery};
use crate::view::View;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One agent decision.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    pub action: Action,
    pub usage: Option<TokenUsage>,
}

impl AgentTurn {
    pub fn with_usage(action: Action, usage: TokenUsage) -> Self {
        Self {
            action,
            usage: Some(usage),
        }
    }
}

impl From<Action> for AgentTurn {
    fn from(action: Action) -> Self {
        Self {
            action,
            usage: None,
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str {
        "agent"
    }

    async fn step(&self, view: &View) -> Result<AgentTurn, AgentError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub rollout_id: RolloutId,
    pub action_id: EventId,
    pub call: ToolCall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub content: String,
    pub exit_code: i32,
    /// Reward for this step, for runtimes that score episodes.
    #[serde(default)]
    pub reward: Option<f64>,
    /// Set when the environment ends the episode with this step.
    #[serde(default)]
    pub done: bool,
    /// Runtime-specific details, recorded verbatim on the observation.
    #[serde(default)]
    pub metadata: Value,
}

impl ExecutionReport {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_reward(mut self, reward: f64, done: bool) -> Self {
        self.reward = Some(reward);
        self.done = done;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, RuntimeError>;
}

/// Read-only, trigger-matched content source.
pub trait KnowledgeProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Lowercase-insensitive phrases that select this provider.
    fn triggers(&self) -> &[String];

    /// Content contributed for a query this provider matched.
    fn recall(&self, query: &str) -> Vec<KnowledgeFragment>;

    /// First trigger found (case-insensitively) inside `query`.
    fn matches(&self, query: &str) -> Option<&str> {
        let query = query.to_lowercase();
        self.triggers()
            .iter()
            .find(|trigger| !trigger.is_empty() && query.contains(&trigger.to_lowercase()))
            .map(String::as_str)
    }
}

#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    async fn save(&self, trajectory: &Trajectory) -> StoreResult<TrajectoryId>;
    async fn get(&self, trajectory_id: &TrajectoryId) -> StoreResult<Trajectory>;
    async fn list(&self, query: &TrajectoryQuery) -> StoreResult<Vec<Trajectory>>;
}
