//! Event taxonomy for the execution engine.
//!
//! An [`Event`] is the immutable record appended to a rollout's log. Its
//! payload is a closed tagged variant: an [`Action`] (something the agent,
//! the user or the environment decided to do), an [`Observation`] (the
//! outcome of an action) or a [`Condensation`] (a marker that a range of
//! earlier events is forgotten by the agent-visible view).

use crate::ids::{EventId, RolloutId};
use crate::knowledge::{KnowledgeFragment, WorkspaceInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    User,
    Environment,
}

/// Token and cost accounting attached to the event produced by an agent call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// An immutable, persisted log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub rollout_id: RolloutId,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    /// For observations: the id of the action that produced them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_id: Option<EventId>,
    /// Hidden events are kept for audit and replay but never reach the view.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub payload: EventPayload,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Event {
    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(observation) => Some(observation),
            _ => None,
        }
    }

    pub fn as_condensation(&self) -> Option<&Condensation> {
        match &self.payload {
            EventPayload::Condensation(condensation) => Some(condensation),
            _ => None,
        }
    }

    /// True for the events that end a rollout: a finish action, a fatal
    /// error or a requested cancellation.
    pub fn is_terminal(&self) -> bool {
        match &self.payload {
            EventPayload::Action(action) => matches!(action, Action::Finish { .. }),
            EventPayload::Observation(observation) => matches!(
                observation,
                Observation::Error { .. }
                    | Observation::Cancelled {
                        reason: CancelReason::Requested
                    }
            ),
            EventPayload::Condensation(_) => false,
        }
    }

    /// Short stable name used in logs and trajectory listings.
    pub fn kind_name(&self) -> &'static str {
        match &self.payload {
            EventPayload::Action(action) => action.kind_name(),
            EventPayload::Observation(observation) => observation.kind_name(),
            EventPayload::Condensation(_) => "condensation",
        }
    }

    /// Rough token estimate (four characters per token) of what the agent
    /// would read for this event.
    pub fn estimated_tokens(&self) -> usize {
        let chars = match &self.payload {
            EventPayload::Action(action) => action.render().len(),
            EventPayload::Observation(observation) => observation.render().len(),
            EventPayload::Condensation(_) => 0,
        };
        chars.div_ceil(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
    Condensation(Condensation),
}

// ─── Actions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Message {
        content: String,
    },
    ToolCall(ToolCall),
    Finish {
        #[serde(default)]
        outputs: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        truncation: Option<TruncationReason>,
    },
    Delegate {
        agent: String,
        task: String,
    },
    Recall {
        recall: RecallKind,
        query: String,
    },
    ConfirmationResponse {
        target: EventId,
        decision: ConfirmationDecision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Action {
    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
        }
    }

    pub fn finish(outputs: Value) -> Self {
        Self::Finish {
            outputs,
            truncation: None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ToolCall(_) => "tool_call",
            Self::Finish { .. } => "finish",
            Self::Delegate { .. } => "delegate",
            Self::Recall { .. } => "recall",
            Self::ConfirmationResponse { .. } => "confirmation_response",
        }
    }

    /// Plain-text rendering used for summaries and token estimates.
    pub fn render(&self) -> String {
        match self {
            Self::Message { content } => content.clone(),
            Self::ToolCall(call) => format!("{}({})", call.tool_name, call.arguments),
            Self::Finish { outputs, .. } => format!("finish: {outputs}"),
            Self::Delegate { agent, task } => format!("delegate to {agent}: {task}"),
            Self::Recall { recall, query } => format!("recall {recall:?}: {query}"),
            Self::ConfirmationResponse {
                target, decision, ..
            } => format!("{decision:?} action {target}"),
        }
    }
}

/// A request for the runtime to run a named tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Set by the agent or by the confirmation policy before the action is
    /// appended; the rollout waits for a confirmation response when true.
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
            requires_confirmation: false,
        }
    }

    pub fn confirmed_only(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecallKind {
    WorkspaceContext,
    Knowledge,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    MaxIterations,
    ContextBudgetExceeded,
}

// ─── Observations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        exit_code: i32,
        /// Step reward reported by the runtime.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reward: Option<f64>,
        /// The environment considers the episode over.
        #[serde(default, skip_serializing_if = "is_false")]
        done: bool,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        metadata: Value,
    },
    RecallResult {
        recall: RecallKind,
        #[serde(default)]
        fragments: Vec<KnowledgeFragment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<WorkspaceInfo>,
    },
    /// A fatal error. Always moves the rollout to ERROR.
    Error {
        error: ErrorKind,
        message: String,
    },
    DelegateResult {
        child: RolloutId,
        agent: String,
        #[serde(default)]
        outputs: Value,
        #[serde(default)]
        truncated: bool,
    },
    DelegateError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child: Option<RolloutId>,
        agent: String,
        error: ErrorKind,
        message: String,
    },
    Cancelled {
        reason: CancelReason,
    },
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Audit record of a retried transient failure.
    Retry {
        attempt: u32,
        max_retries: u32,
        backoff_ms: u64,
        error: ErrorKind,
        message: String,
    },
    /// Stands in for a forgotten range. Exists only inside views.
    Condensed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        forgotten: u64,
    },
}

impl Observation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ToolResult { .. } => "tool_result",
            Self::RecallResult { .. } => "recall_result",
            Self::Error { .. } => "error",
            Self::DelegateResult { .. } => "delegate_result",
            Self::DelegateError { .. } => "delegate_error",
            Self::Cancelled { .. } => "cancelled",
            Self::Rejected { .. } => "rejected",
            Self::Retry { .. } => "retry",
            Self::Condensed { .. } => "condensed",
        }
    }

    /// Whether this observation is the outcome of its causing action, as
    /// opposed to a notice (retry records, fatal errors, requested cancels).
    pub fn fulfills_cause(&self) -> bool {
        match self {
            Self::ToolResult { .. }
            | Self::RecallResult { .. }
            | Self::DelegateResult { .. }
            | Self::DelegateError { .. }
            | Self::Rejected { .. } => true,
            Self::Cancelled { reason } => *reason == CancelReason::Timeout,
            Self::Error { .. } | Self::Retry { .. } | Self::Condensed { .. } => false,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::ToolResult {
                tool_name,
                content,
                exit_code,
                ..
            } => format!("{tool_name} exited {exit_code}: {content}"),
            Self::RecallResult {
                fragments,
                workspace,
                ..
            } => {
                let mut parts: Vec<String> = Vec::new();
                if let Some(workspace) = workspace {
                    parts.push(workspace.render());
                }
                parts.extend(
                    fragments
                        .iter()
                        .map(|fragment| format!("[{}] {}", fragment.provider, fragment.content)),
                );
                parts.join("\n")
            }
            Self::Error { error, message } => format!("error ({error:?}): {message}"),
            Self::DelegateResult { agent, outputs, .. } => format!("{agent} finished: {outputs}"),
            Self::DelegateError {
                agent,
                error,
                message,
                ..
            } => format!("{agent} failed ({error:?}): {message}"),
            Self::Cancelled { reason } => format!("cancelled ({reason:?})"),
            Self::Rejected { reason } => match reason {
                Some(reason) => format!("action rejected: {reason}"),
                None => "action rejected".to_owned(),
            },
            Self::Retry {
                attempt,
                max_retries,
                message,
                ..
            } => format!("retry {attempt}/{max_retries}: {message}"),
            Self::Condensed { summary, forgotten } => match summary {
                Some(summary) => summary.clone(),
                None => format!("[{forgotten} earlier events elided]"),
            },
        }
    }
}

/// Error taxonomy recorded in error-bearing observations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientRuntime,
    FatalRuntime,
    TransientAgent,
    FatalAgent,
    DelegationDepthExceeded,
    DelegateFailed,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRuntime | Self::TransientAgent)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A cancel was requested for the rollout. Terminal.
    Requested,
    /// The in-flight runtime call exceeded its timeout and was dropped.
    Timeout,
}

// ─── Condensation ───────────────────────────────────────────────────

/// Marks the inclusive id range `[forgotten_start, forgotten_end]` as
/// forgotten by the view. Applies only to events older than itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condensation {
    pub forgotten_start: EventId,
    pub forgotten_end: EventId,
    /// Number of view events the range covered when it was computed.
    pub forgotten_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub strategy: CondensationStrategy,
}

/// What replaces a forgotten range in the view.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CondensationStrategy {
    /// A synthesized summary of the forgotten events.
    #[default]
    Summary,
    /// A bare elision marker.
    Elide,
}

impl Condensation {
    pub fn forgets(&self, id: EventId) -> bool {
        (self.forgotten_start..=self.forgotten_end).contains(&id)
    }
}

// ─── Drafts ─────────────────────────────────────────────────────────

/// An event before the log assigns it an id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub rollout_id: RolloutId,
    pub source: EventSource,
    pub cause_id: Option<EventId>,
    pub hidden: bool,
    pub usage: Option<TokenUsage>,
    pub payload: EventPayload,
}

impl EventDraft {
    pub fn action(rollout_id: RolloutId, source: EventSource, action: Action) -> Self {
        Self {
            rollout_id,
            source,
            cause_id: None,
            hidden: false,
            usage: None,
            payload: EventPayload::Action(action),
        }
    }

    pub fn observation(rollout_id: RolloutId, cause_id: EventId, observation: Observation) -> Self {
        Self {
            rollout_id,
            source: EventSource::Environment,
            cause_id: Some(cause_id),
            hidden: false,
            usage: None,
            payload: EventPayload::Observation(observation),
        }
    }

    pub fn condensation(rollout_id: RolloutId, condensation: Condensation) -> Self {
        Self {
            rollout_id,
            source: EventSource::Environment,
            cause_id: None,
            hidden: false,
            usage: None,
            payload: EventPayload::Condensation(condensation),
        }
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn into_event(self, id: EventId, timestamp: DateTime<Utc>) -> Event {
        Event {
            id,
            rollout_id: self.rollout_id,
            timestamp,
            source: self.source,
            cause_id: self.cause_id,
            hidden: self.hidden,
            usage: self.usage,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_event_serializes_with_kind_and_type_tags() {
        let draft = EventDraft::action(
            RolloutId::from_string("R1"),
            EventSource::Agent,
            Action::ToolCall(ToolCall::new("shell", json!({"cmd": "ls"}))),
        );
        let event = draft.into_event(3, Utc::now());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["kind"], "action");
        assert_eq!(value["payload"]["data"]["type"], "tool_call");
        assert!(value.get("hidden").is_none());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn retry_notices_do_not_fulfill_their_cause() {
        let retry = Observation::Retry {
            attempt: 1,
            max_retries: 3,
            backoff_ms: 100,
            error: ErrorKind::TransientRuntime,
            message: "connection reset".into(),
        };
        assert!(!retry.fulfills_cause());
        assert!(
            Observation::Cancelled {
                reason: CancelReason::Timeout
            }
            .fulfills_cause()
        );
        assert!(
            !Observation::Cancelled {
                reason: CancelReason::Requested
            }
            .fulfills_cause()
        );
    }

    #[test]
    fn tool_result_keeps_reward_and_runtime_metadata() {
        let observation = Observation::ToolResult {
            call_id: "c1".into(),
            tool_name: "submit".into(),
            content: "accepted".into(),
            exit_code: 0,
            reward: Some(1.0),
            done: true,
            metadata: json!({"tests_passed": 12}),
        };
        let value = serde_json::to_value(&observation).unwrap();
        assert_eq!(value["reward"], 1.0);
        assert_eq!(value["done"], true);
        assert_eq!(value["metadata"]["tests_passed"], 12);

        let plain: Observation = serde_json::from_value(json!({
            "type": "tool_result",
            "call_id": "c2",
            "tool_name": "ls",
            "content": "",
            "exit_code": 0
        }))
        .unwrap();
        let Observation::ToolResult {
            reward,
            done,
            metadata,
            ..
        } = plain
        else {
            panic!("expected a tool result");
        };
        assert_eq!((reward, done, metadata), (None, false, Value::Null));
    }

    #[test]
    fn condensation_range_is_inclusive() {
        let condensation = Condensation {
            forgotten_start: 2,
            forgotten_end: 5,
            forgotten_count: 4,
            summary: None,
            strategy: CondensationStrategy::Elide,
        };
        assert!(!condensation.forgets(1));
        assert!(condensation.forgets(2));
        assert!(condensation.forgets(5));
        assert!(!condensation.forgets(6));
    }

    #[test]
    fn estimated_tokens_rounds_up() {
        let event = EventDraft::action(
            RolloutId::from_string("R1"),
            EventSource::User,
            Action::message("hello"),
        )
        .into_event(0, Utc::now());
        assert_eq!(event.estimated_tokens(), 2);
    }
}
