use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tiller_condenser::Condenser;
use tiller_events::{EventLog, Subscription};
use tiller_protocol::{
    Action, Agent, AgentError, AgentTurn, CancelReason, ErrorKind, Event, EventDraft, EventId,
    EventPayload, EventSource, ExecutionRequest, Observation, RecallKind, RolloutId,
    RolloutState, RolloutStatus, Runtime, TruncationReason,
};
use tiller_recall::RecallCoordinator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::confirmation::ConfirmationPolicy;
use crate::delegate::{DelegateManager, DelegationNode};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Agent invocations allowed before the rollout is cut off.
    pub max_iterations: u32,
    /// Runtime calls running longer are dropped and recorded as timed out.
    pub runtime_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            runtime_timeout_ms: 120_000,
        }
    }
}

impl ControllerConfig {
    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("max_iterations must be at least 1");
        }
        if self.runtime_timeout_ms == 0 {
            bail!("runtime_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// What to run: a task for an agent, optionally as someone's child.
#[derive(Clone)]
pub struct RolloutSpec {
    pub rollout_id: RolloutId,
    pub agent: Arc<dyn Agent>,
    pub agent_name: String,
    pub task: String,
    pub parent: Option<RolloutId>,
    pub depth: u32,
}

impl RolloutSpec {
    pub fn new(agent: Arc<dyn Agent>, task: impl Into<String>) -> Self {
        Self {
            rollout_id: RolloutId::new_uuid(),
            agent_name: agent.name().to_owned(),
            agent,
            task: task.into(),
            parent: None,
            depth: 0,
        }
    }

    pub fn with_id(mut self, rollout_id: RolloutId) -> Self {
        self.rollout_id = rollout_id;
        self
    }
}

/// Collaborators shared by every rollout: log, runtime, condenser, recall,
/// policies and the delegation tree.
pub struct Engine {
    log: EventLog,
    runtime: Arc<dyn Runtime>,
    condenser: Condenser,
    recall: RecallCoordinator,
    confirmation: ConfirmationPolicy,
    retry: RetryPolicy,
    config: ControllerConfig,
    delegates: DelegateManager,
}

impl Engine {
    pub fn new(
        log: EventLog,
        runtime: Arc<dyn Runtime>,
        condenser: Condenser,
        recall: RecallCoordinator,
        delegates: DelegateManager,
    ) -> Self {
        Self {
            log,
            runtime,
            condenser,
            recall,
            confirmation: ConfirmationPolicy::default(),
            retry: RetryPolicy::default(),
            config: ControllerConfig::default(),
            delegates,
        }
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationPolicy) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn delegates(&self) -> &DelegateManager {
        &self.delegates
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Build a controller for `spec`. A new rollout gets its task framing
    /// appended; an existing log is replayed and the rollout resumes where
    /// it stopped.
    #[instrument(skip(self, spec, cancel), fields(rollout_id = %spec.rollout_id, depth = spec.depth))]
    pub async fn launch(
        self: &Arc<Self>,
        spec: RolloutSpec,
        cancel: CancellationToken,
    ) -> Result<Controller> {
        let subscription = self.log.subscribe(&spec.rollout_id, 0).await?;
        self.delegates.tree().insert(
            spec.rollout_id.clone(),
            DelegationNode {
                parent: spec.parent.clone(),
                depth: spec.depth,
                agent: spec.agent_name.clone(),
                status: RolloutStatus::Idle,
            },
        );

        let mut controller = Controller {
            engine: Arc::clone(self),
            agent: spec.agent,
            rollout_id: spec.rollout_id.clone(),
            depth: spec.depth,
            framing: spec.task.clone(),
            cancel,
            state: RolloutState::new(spec.rollout_id.clone()),
            subscription,
            agent_failures: 0,
        };
        controller.drain();

        match controller.state.last_event {
            None => {
                controller
                    .append(EventDraft::action(
                        spec.rollout_id,
                        EventSource::User,
                        Action::message(spec.task),
                    ))
                    .await?;
                info!(agent = %spec.agent_name, "rollout started");
            }
            Some(last_event) => {
                info!(last_event, status = ?controller.state.status, "rollout resumed");
            }
        }
        Ok(controller)
    }
}

/// Drives one rollout. Its state only advances on events of its own
/// rollout, read in id order from its own subscription.
pub struct Controller {
    engine: Arc<Engine>,
    agent: Arc<dyn Agent>,
    rollout_id: RolloutId,
    depth: u32,
    framing: String,
    cancel: CancellationToken,
    state: RolloutState,
    subscription: Subscription,
    agent_failures: u32,
}

impl Controller {
    pub fn rollout_id(&self) -> &RolloutId {
        &self.rollout_id
    }

    pub fn state(&self) -> &RolloutState {
        &self.state
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// [`run`](Self::run) behind a boxed future, for spawning children.
    pub fn run_boxed(self) -> BoxFuture<'static, Result<RolloutState>> {
        self.run().boxed()
    }

    /// Step until the rollout is terminal. Errors are returned only when the
    /// log itself cannot be written.
    #[instrument(skip(self), fields(rollout_id = %self.rollout_id, depth = self.depth))]
    pub async fn run(mut self) -> Result<RolloutState> {
        loop {
            self.drain();
            if self.state.status.is_terminal() {
                break;
            }
            if self.cancel.is_cancelled() {
                self.record_cancel().await?;
                continue;
            }
            match self.state.status {
                RolloutStatus::Idle | RolloutStatus::Running => self.step().await?,
                RolloutStatus::AwaitingObservation => self.execute().await?,
                RolloutStatus::AwaitingConfirmation => self.await_confirmation().await?,
                RolloutStatus::Delegating => self.delegate().await?,
                RolloutStatus::Finished | RolloutStatus::Error | RolloutStatus::Cancelled => break,
            }
        }

        info!(
            status = ?self.state.status,
            iterations = self.state.iteration,
            truncated = self.state.truncated,
            "rollout ended"
        );
        Ok(self.state)
    }

    // ─── Log plumbing ───────────────────────────────────────────────

    fn apply(&mut self, event: &Event) {
        if event.id == 0
            && let EventPayload::Action(Action::Message { content }) = &event.payload
        {
            self.framing = content.clone();
        }
        let before = self.state.status;
        self.state.apply(event);
        if self.state.status != before {
            debug!(event_id = event.id, from = ?before, to = ?self.state.status, "status changed");
            self.engine
                .delegates
                .tree()
                .set_status(&self.rollout_id, self.state.status);
        }
    }

    fn drain(&mut self) {
        while let Some(event) = self.subscription.try_recv() {
            self.apply(&event);
        }
    }

    /// Append and apply everything up to and including the new event.
    async fn append(&mut self, draft: EventDraft) -> Result<Event> {
        let event = self.engine.log.append(draft).await?;
        while self.state.last_event.is_none_or(|last| last < event.id) {
            let next = self
                .subscription
                .recv()
                .await
                .context("rollout subscription closed")?;
            self.apply(&next);
        }
        Ok(event)
    }

    async fn observe(&mut self, cause: EventId, observation: Observation) -> Result<()> {
        let draft = EventDraft::observation(self.rollout_id.clone(), cause, observation);
        self.append(draft).await.map(|_| ())
    }

    /// The action a notice refers to: the pending one, else the latest.
    fn cause(&self) -> EventId {
        self.state
            .pending
            .as_ref()
            .map(|pending| pending.id)
            .or(self.state.last_action)
            .unwrap_or(0)
    }

    async fn fail(&mut self, kind: ErrorKind, message: String, source: EventSource) -> Result<()> {
        warn!(?kind, %message, "rollout failed");
        let draft = EventDraft::observation(
            self.rollout_id.clone(),
            self.cause(),
            Observation::Error {
                error: kind,
                message,
            },
        )
        .with_source(source);
        self.append(draft).await.map(|_| ())
    }

    async fn record_cancel(&mut self) -> Result<()> {
        info!("cancelling rollout");
        self.observe(
            self.cause(),
            Observation::Cancelled {
                reason: CancelReason::Requested,
            },
        )
        .await
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    // ─── RUNNING ────────────────────────────────────────────────────

    async fn step(&mut self) -> Result<()> {
        if let Some(pending) = self.state.pending.clone() {
            if pending.is_rejected() {
                info!(action_id = pending.id, "action rejected");
                return self
                    .observe(
                        pending.id,
                        Observation::Rejected {
                            reason: pending.rejection_reason,
                        },
                    )
                    .await;
            }
            if let Action::Recall { recall, query } = &pending.action {
                return self.answer_recall(pending.id, *recall, query).await;
            }
        }

        if self.state.episode_done {
            info!(reward = self.state.reward, "environment ended the episode");
            return self.finish_from_environment(None).await;
        }
        let max_iterations = self.engine.config.max_iterations;
        if self.state.iteration >= max_iterations {
            info!(max_iterations, "iteration cap reached");
            return self
                .finish_from_environment(Some(TruncationReason::MaxIterations))
                .await;
        }
        if !self.condense().await? {
            warn!("view exceeds budget even after maximal condensation");
            return self
                .finish_from_environment(Some(TruncationReason::ContextBudgetExceeded))
                .await;
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            outcome = self.agent.step(&self.state.view) => outcome,
        };
        match outcome {
            Ok(turn) => {
                self.agent_failures = 0;
                self.dispatch(turn).await
            }
            Err(error) => self.agent_failed(error).await,
        }
    }

    /// Returns whether the view fits its budget afterwards.
    async fn condense(&mut self) -> Result<bool> {
        let engine = Arc::clone(&self.engine);
        if let Some(condensation) = engine.condenser.condense(&self.state.view) {
            self.append(EventDraft::condensation(self.rollout_id.clone(), condensation))
                .await?;
        }
        if !engine.condenser.should_condense(&self.state.view) {
            return Ok(true);
        }
        if let Some(condensation) = engine.condenser.maximal_condensation(&self.state.view) {
            self.append(EventDraft::condensation(self.rollout_id.clone(), condensation))
                .await?;
        }
        Ok(!engine.condenser.should_condense(&self.state.view))
    }

    async fn finish_from_environment(&mut self, truncation: Option<TruncationReason>) -> Result<()> {
        let draft = EventDraft::action(
            self.rollout_id.clone(),
            EventSource::Environment,
            Action::Finish {
                outputs: serde_json::Value::Null,
                truncation,
            },
        );
        self.append(draft).await.map(|_| ())
    }

    async fn dispatch(&mut self, turn: AgentTurn) -> Result<()> {
        let action = match turn.action {
            Action::ToolCall(call) => Action::ToolCall(self.engine.confirmation.apply(call)),
            Action::ConfirmationResponse { .. } => {
                return self
                    .fail(
                        ErrorKind::FatalAgent,
                        "agent answered a confirmation request".to_owned(),
                        EventSource::Agent,
                    )
                    .await;
            }
            action => action,
        };

        let draft = EventDraft::action(self.rollout_id.clone(), EventSource::Agent, action)
            .with_usage(turn.usage);
        let event = self.append(draft).await?;
        debug!(event_id = event.id, kind = event.kind_name(), "agent action appended");

        if let Some(Action::Recall { recall, query }) = event.as_action() {
            self.answer_recall(event.id, *recall, query).await?;
        }
        Ok(())
    }

    async fn agent_failed(&mut self, error: AgentError) -> Result<()> {
        let kind = error.kind();
        let max_retries = self.engine.retry.max_retries;
        if kind.is_retryable() && self.agent_failures < max_retries {
            self.agent_failures += 1;
            let attempt = self.agent_failures;
            let backoff_ms = self.engine.retry.backoff_ms(attempt);
            warn!(attempt, max_retries, backoff_ms, %error, "agent call failed, retrying");
            let draft = EventDraft::observation(
                self.rollout_id.clone(),
                self.cause(),
                Observation::Retry {
                    attempt,
                    max_retries,
                    backoff_ms,
                    error: kind,
                    message: error.message().to_owned(),
                },
            )
            .with_source(EventSource::Agent)
            .hidden();
            self.append(draft).await?;
            self.sleep(Duration::from_millis(backoff_ms)).await;
            return Ok(());
        }

        let message = if kind.is_retryable() {
            format!("{} (gave up after {max_retries} retries)", error.message())
        } else {
            error.message().to_owned()
        };
        self.fail(kind, message, EventSource::Agent).await
    }

    async fn answer_recall(&mut self, action_id: EventId, kind: RecallKind, query: &str) -> Result<()> {
        let draft = self
            .engine
            .recall
            .respond(&self.rollout_id, action_id, kind, query, &self.framing);
        self.append(draft).await.map(|_| ())
    }

    // ─── AWAITING_OBSERVATION ───────────────────────────────────────

    async fn execute(&mut self) -> Result<()> {
        let Some(pending) = self.state.pending.clone() else {
            return self
                .fail(
                    ErrorKind::Internal,
                    "awaiting an observation with no pending action".to_owned(),
                    EventSource::Environment,
                )
                .await;
        };
        let Action::ToolCall(call) = pending.action else {
            return self
                .fail(
                    ErrorKind::Internal,
                    format!("action {} cannot be executed by the runtime", pending.id),
                    EventSource::Environment,
                )
                .await;
        };

        let engine = Arc::clone(&self.engine);
        let max_retries = engine.retry.max_retries;
        let mut attempt = 0;
        loop {
            let request = ExecutionRequest {
                rollout_id: self.rollout_id.clone(),
                action_id: pending.id,
                call: call.clone(),
            };
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                outcome = tokio::time::timeout(
                    engine.config.runtime_timeout(),
                    engine.runtime.execute(request),
                ) => outcome,
            };

            let observation = match outcome {
                Err(_elapsed) => {
                    warn!(
                        tool = %call.tool_name,
                        timeout_ms = engine.config.runtime_timeout_ms,
                        "runtime call timed out"
                    );
                    Observation::Cancelled {
                        reason: CancelReason::Timeout,
                    }
                }
                Ok(Ok(report)) => {
                    debug!(
                        tool = %call.tool_name,
                        exit_code = report.exit_code,
                        reward = ?report.reward,
                        done = report.done,
                        "tool executed"
                    );
                    Observation::ToolResult {
                        call_id: call.call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        content: report.content,
                        exit_code: report.exit_code,
                        reward: report.reward,
                        done: report.done,
                        metadata: report.metadata,
                    }
                }
                Ok(Err(error)) if error.kind().is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    let backoff_ms = engine.retry.backoff_ms(attempt);
                    warn!(attempt, max_retries, backoff_ms, %error, "runtime call failed, retrying");
                    let draft = EventDraft::observation(
                        self.rollout_id.clone(),
                        pending.id,
                        Observation::Retry {
                            attempt,
                            max_retries,
                            backoff_ms,
                            error: error.kind(),
                            message: error.message().to_owned(),
                        },
                    )
                    .hidden();
                    self.append(draft).await?;
                    self.sleep(Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                Ok(Err(error)) => {
                    let message = if error.kind().is_retryable() {
                        format!("{} (gave up after {max_retries} retries)", error.message())
                    } else {
                        error.message().to_owned()
                    };
                    return self.fail(error.kind(), message, EventSource::Environment).await;
                }
            };
            return self.observe(pending.id, observation).await;
        }
    }

    // ─── AWAITING_CONFIRMATION ──────────────────────────────────────

    async fn await_confirmation(&mut self) -> Result<()> {
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            event = self.subscription.recv() => event,
        };
        let event = event.context("rollout subscription closed")?;
        self.apply(&event);
        Ok(())
    }

    // ─── DELEGATING ─────────────────────────────────────────────────

    async fn delegate(&mut self) -> Result<()> {
        let Some(pending) = self.state.pending.clone() else {
            return self
                .fail(
                    ErrorKind::Internal,
                    "delegating with no pending action".to_owned(),
                    EventSource::Environment,
                )
                .await;
        };
        let Action::Delegate { agent, task } = &pending.action else {
            return self
                .fail(
                    ErrorKind::Internal,
                    format!("action {} is not a delegation", pending.id),
                    EventSource::Environment,
                )
                .await;
        };

        let engine = Arc::clone(&self.engine);
        let observation = engine
            .delegates
            .delegate(&engine, &self.rollout_id, self.depth, agent, task, &self.cancel)
            .await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.observe(pending.id, observation).await
    }
}
