//! Rollout state and the reducer that drives it.
//!
//! [`RolloutState::apply`] is the only place a rollout's status changes. The
//! controller feeds it every event of its own rollout in id order, and
//! [`RolloutState::replay`] feeds it a stored log, so a live run and a replay
//! of its log always record the same transition list.

use crate::event::{
    Action, CancelReason, ConfirmationDecision, ErrorKind, Event, EventPayload, EventSource,
    Observation,
};
use crate::ids::{EventId, RolloutId};
use crate::view::View;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    #[default]
    Idle,
    Running,
    AwaitingObservation,
    AwaitingConfirmation,
    Delegating,
    Finished,
    Error,
    Cancelled,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }
}

/// Accumulated token, cost and activity counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolloutMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub tool_calls: u32,
    pub recalls: u32,
    pub delegations: u32,
    pub retries: u32,
    pub condensations: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    pub event_id: EventId,
    pub from: RolloutStatus,
    pub to: RolloutStatus,
}

/// The action the rollout is currently resolving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAction {
    pub id: EventId,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ConfirmationDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl PendingAction {
    /// True once a rejection arrived and the rejected observation is still owed.
    pub fn is_rejected(&self) -> bool {
        self.decision == Some(ConfirmationDecision::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutState {
    pub rollout_id: RolloutId,
    pub status: RolloutStatus,
    pub view: View,
    /// Number of agent invocations so far.
    pub iteration: u32,
    pub truncated: bool,
    /// Sum of the step rewards reported with tool results.
    #[serde(default)]
    pub reward: f64,
    /// The runtime reported the episode over; the rollout finishes next.
    #[serde(default)]
    pub episode_done: bool,
    pub metrics: RolloutMetrics,
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RolloutFailure>,
}

impl RolloutState {
    pub fn new(rollout_id: RolloutId) -> Self {
        Self {
            rollout_id,
            status: RolloutStatus::Idle,
            view: View::new(),
            iteration: 0,
            truncated: false,
            reward: 0.0,
            episode_done: false,
            metrics: RolloutMetrics::default(),
            transitions: Vec::new(),
            pending: None,
            last_action: None,
            last_event: None,
            outputs: None,
            failure: None,
        }
    }

    /// Rebuild a state from a stored log.
    pub fn replay<'a>(rollout_id: RolloutId, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::new(rollout_id);
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Id the next appended event will receive.
    pub fn next_event_id(&self) -> EventId {
        self.last_event.map_or(0, |id| id + 1)
    }

    /// Fold one event into the state.
    pub fn apply(&mut self, event: &Event) {
        self.last_event = Some(event.id);
        self.view.apply(event);

        if event.source == EventSource::Agent {
            self.iteration += 1;
        }
        if let Some(usage) = event.usage {
            self.metrics.prompt_tokens += usage.prompt_tokens;
            self.metrics.completion_tokens += usage.completion_tokens;
            self.metrics.cost_usd += usage.cost_usd;
        }

        if self.status.is_terminal() {
            return;
        }

        let next = match &event.payload {
            EventPayload::Action(action) => self.apply_action(event.id, action),
            EventPayload::Observation(observation) => {
                self.apply_observation(event.cause_id, observation)
            }
            EventPayload::Condensation(_) => {
                self.metrics.condensations += 1;
                self.status
            }
        };
        self.transition(event.id, next);
    }

    fn apply_action(&mut self, id: EventId, action: &Action) -> RolloutStatus {
        if let Action::ConfirmationResponse {
            target,
            decision,
            reason,
        } = action
        {
            return self.apply_confirmation(*target, *decision, reason.clone());
        }

        self.last_action = Some(id);
        let pending = |action: &Action| PendingAction {
            id,
            action: action.clone(),
            decision: None,
            rejection_reason: None,
        };
        match action {
            Action::Message { .. } => RolloutStatus::Running,
            Action::ToolCall(call) => {
                self.metrics.tool_calls += 1;
                self.pending = Some(pending(action));
                if call.requires_confirmation {
                    RolloutStatus::AwaitingConfirmation
                } else {
                    RolloutStatus::AwaitingObservation
                }
            }
            Action::Finish {
                outputs,
                truncation,
            } => {
                self.pending = None;
                self.truncated = truncation.is_some();
                self.outputs = Some(outputs.clone());
                RolloutStatus::Finished
            }
            Action::Delegate { .. } => {
                self.metrics.delegations += 1;
                self.pending = Some(pending(action));
                RolloutStatus::Delegating
            }
            Action::Recall { .. } => {
                self.metrics.recalls += 1;
                self.pending = Some(pending(action));
                RolloutStatus::Running
            }
            Action::ConfirmationResponse { .. } => self.status,
        }
    }

    fn apply_confirmation(
        &mut self,
        target: EventId,
        decision: ConfirmationDecision,
        reason: Option<String>,
    ) -> RolloutStatus {
        if self.status != RolloutStatus::AwaitingConfirmation {
            return self.status;
        }
        let Some(pending) = self.pending.as_mut() else {
            return self.status;
        };
        if pending.id != target {
            return self.status;
        }
        pending.decision = Some(decision);
        match decision {
            ConfirmationDecision::Confirmed => RolloutStatus::AwaitingObservation,
            ConfirmationDecision::Rejected => {
                pending.rejection_reason = reason;
                RolloutStatus::Running
            }
        }
    }

    fn apply_observation(
        &mut self,
        cause_id: Option<EventId>,
        observation: &Observation,
    ) -> RolloutStatus {
        match observation {
            Observation::Error { error, message } => {
                self.pending = None;
                self.failure = Some(RolloutFailure {
                    kind: *error,
                    message: message.clone(),
                });
                RolloutStatus::Error
            }
            Observation::Cancelled {
                reason: CancelReason::Requested,
            } => {
                self.pending = None;
                RolloutStatus::Cancelled
            }
            Observation::Retry { .. } => {
                self.metrics.retries += 1;
                self.status
            }
            _ if observation.fulfills_cause() => {
                let fulfils_pending = self
                    .pending
                    .as_ref()
                    .is_some_and(|pending| Some(pending.id) == cause_id);
                if fulfils_pending {
                    if let Observation::ToolResult { reward, done, .. } = observation {
                        self.reward += reward.unwrap_or(0.0);
                        self.episode_done |= *done;
                    }
                    self.pending = None;
                    RolloutStatus::Running
                } else {
                    self.status
                }
            }
            _ => self.status,
        }
    }

    fn transition(&mut self, event_id: EventId, to: RolloutStatus) {
        if to == self.status {
            return;
        }
        self.transitions.push(Transition {
            event_id,
            from: self.status,
            to,
        });
        self.status = to;
    }
}
