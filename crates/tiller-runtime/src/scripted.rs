//! Deterministic agent and runtime used by the daemon's scripted mode and
//! by tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tiller_protocol::{
    Action, Agent, AgentError, AgentTurn, ExecutionReport, ExecutionRequest, Runtime,
    RuntimeError, TokenUsage, View,
};

/// One scripted agent decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    Act {
        action: Action,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Fail {
        #[serde(default)]
        transient: bool,
        message: String,
    },
}

impl ScriptStep {
    pub fn act(action: Action) -> Self {
        Self::Act {
            action,
            usage: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Fail {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fail {
            transient: false,
            message: message.into(),
        }
    }
}

/// Plays back a fixed list of steps. Once the script runs out it finishes
/// with null outputs, or keeps repeating the last step when built with
/// [`repeating`](Self::repeating).
#[derive(Debug)]
pub struct ScriptedAgent {
    name: String,
    steps: Vec<ScriptStep>,
    cursor: AtomicUsize,
    repeat_last: bool,
    think_time: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            cursor: AtomicUsize::new(0),
            repeat_last: false,
            think_time: None,
        }
    }

    pub fn from_actions(name: impl Into<String>, actions: impl IntoIterator<Item = Action>) -> Self {
        Self::new(name, actions.into_iter().map(ScriptStep::act).collect())
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = Some(think_time);
        self
    }

    /// Steps taken so far.
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&self, _view: &View) -> Result<AgentTurn, AgentError> {
        if let Some(think_time) = self.think_time {
            tokio::time::sleep(think_time).await;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let step = match self.steps.get(index) {
            Some(step) => step,
            None if self.repeat_last => match self.steps.last() {
                Some(step) => step,
                None => return Ok(Action::finish(serde_json::Value::Null).into()),
            },
            None => return Ok(Action::finish(serde_json::Value::Null).into()),
        };
        match step {
            ScriptStep::Act { action, usage } => Ok(AgentTurn {
                action: action.clone(),
                usage: *usage,
            }),
            ScriptStep::Fail {
                transient: true,
                message,
            } => Err(AgentError::Transient(message.clone())),
            ScriptStep::Fail { message, .. } => Err(AgentError::Fatal(message.clone())),
        }
    }
}

/// Answers every tool call with `"<tool>: <arguments>"`.
#[derive(Debug, Default)]
pub struct EchoRuntime {
    latency: Option<Duration>,
    transient_failures: AtomicU32,
    calls: AtomicUsize,
}

impl EchoRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` calls with a transient error.
    pub fn failing_first(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for EchoRuntime {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, RuntimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::Transient("runtime unavailable".to_owned()));
        }
        Ok(ExecutionReport::ok(format!(
            "{}: {}",
            request.call.tool_name, request.call.arguments
        )))
    }
}
