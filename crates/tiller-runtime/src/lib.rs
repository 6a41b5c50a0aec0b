//! Rollout execution.
//!
//! A [`Controller`] drives one rollout through its state machine: it asks
//! the agent for an action, routes tool calls to the [`Runtime`], answers
//! recalls inline, waits on confirmations and spawns children for
//! delegations. Every transition is the result of applying an event read
//! back from the rollout's own subscription, so replaying a stored log
//! reproduces the live state exactly.
//!
//! [`Runtime`]: tiller_protocol::Runtime

mod confirmation;
mod controller;
mod delegate;
mod retry;
mod scripted;

pub use confirmation::ConfirmationPolicy;
pub use controller::{Controller, ControllerConfig, Engine, RolloutSpec};
pub use delegate::{AgentRegistry, DelegateManager, DelegationNode, DelegationTree};
pub use retry::RetryPolicy;
pub use scripted::{EchoRuntime, ScriptStep, ScriptedAgent};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::json;
    use tiller_condenser::{Condenser, CondenserConfig};
    use tiller_events::{EventLog, MemoryEventStore};
    use tiller_protocol::{
        Action, CancelReason, ConfirmationDecision, ErrorKind, Event, EventDraft, EventSource,
        ExecutionReport, ExecutionRequest, KnowledgeProvider, Observation, RecallKind, RolloutId,
        RolloutStatus, Runtime, RuntimeError, ToolCall, TruncationReason, validate_log,
    };
    use tiller_recall::{ProviderSet, RecallConfig, RecallCoordinator, StaticKnowledgeProvider};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct Fixture {
        runtime: Arc<dyn Runtime>,
        registry: AgentRegistry,
        providers: ProviderSet,
        config: ControllerConfig,
        condenser: CondenserConfig,
        confirmation: ConfirmationPolicy,
        retry: RetryPolicy,
        max_depth: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                runtime: Arc::new(EchoRuntime::new()),
                registry: AgentRegistry::new(),
                providers: ProviderSet::empty(),
                config: ControllerConfig::default(),
                condenser: CondenserConfig::default(),
                confirmation: ConfirmationPolicy::default(),
                retry: RetryPolicy {
                    max_retries: 3,
                    initial_backoff_ms: 1,
                    multiplier: 2,
                    max_backoff_ms: 4,
                },
                max_depth: 3,
            }
        }

        fn build(self) -> Arc<Engine> {
            let log = EventLog::new(Arc::new(MemoryEventStore::new()));
            let condenser = Condenser::new(self.condenser).unwrap();
            let recall =
                RecallCoordinator::new(Arc::new(self.providers), &RecallConfig::default());
            let delegates = DelegateManager::new(self.registry, self.max_depth);
            Arc::new(
                Engine::new(log, self.runtime, condenser, recall, delegates)
                    .with_config(self.config)
                    .with_confirmation(self.confirmation)
                    .with_retry(self.retry),
            )
        }
    }

    async fn run(
        engine: &Arc<Engine>,
        agent: ScriptedAgent,
        task: &str,
    ) -> Result<(RolloutId, tiller_protocol::RolloutState, Vec<Event>)> {
        let spec = RolloutSpec::new(Arc::new(agent), task);
        let rollout_id = spec.rollout_id.clone();
        let controller = engine.launch(spec, CancellationToken::new()).await?;
        let state = controller.run().await?;
        let events = engine.log().read_all(&rollout_id).await?;
        Ok((rollout_id, state, events))
    }

    #[tokio::test]
    async fn tool_call_round_trip_finishes() -> Result<()> {
        let engine = Fixture::new().build();
        let agent = ScriptedAgent::from_actions(
            "coder",
            [
                Action::ToolCall(ToolCall::new("ls", json!({"path": "."}))),
                Action::finish(json!({"answer": 42})),
            ],
        );
        let (rollout_id, state, events) = run(&engine, agent, "list files").await?;

        assert_eq!(state.status, RolloutStatus::Finished);
        assert_eq!(state.outputs, Some(json!({"answer": 42})));
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(events[0].source, EventSource::User);
        assert_eq!(events[2].cause_id, Some(1));
        assert!(matches!(
            events[2].as_observation(),
            Some(Observation::ToolResult { exit_code: 0, .. })
        ));
        validate_log(&rollout_id, &events)?;
        Ok(())
    }

    #[tokio::test]
    async fn iteration_cap_truncates_with_environment_finish() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.config.max_iterations = 5;
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions("chatty", [Action::message("thinking")]).repeating();

        let (_, state, events) = run(&engine, agent, "never ends").await?;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert!(state.truncated);
        assert_eq!(state.iteration, 5);
        let last = events.last().unwrap();
        assert_eq!(last.source, EventSource::Environment);
        assert!(matches!(
            last.as_action(),
            Some(Action::Finish {
                truncation: Some(TruncationReason::MaxIterations),
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn transient_agent_failures_are_retried_and_hidden() -> Result<()> {
        let engine = Fixture::new().build();
        let agent = ScriptedAgent::new(
            "flaky",
            vec![
                ScriptStep::transient("rate limited"),
                ScriptStep::transient("rate limited"),
                ScriptStep::act(Action::finish(json!(null))),
            ],
        );
        let (_, state, events) = run(&engine, agent, "try hard").await?;

        assert_eq!(state.status, RolloutStatus::Finished);
        assert_eq!(state.metrics.retries, 2);
        let hidden: Vec<&Event> = events.iter().filter(|e| e.hidden).collect();
        assert_eq!(hidden.len(), 2);
        assert!(state.view.iter().all(|e| !e.hidden));
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_error() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.retry.max_retries = 1;
        let engine = fixture.build();
        let agent = ScriptedAgent::new("down", vec![ScriptStep::transient("503")]).repeating();

        let (_, state, _) = run(&engine, agent, "doomed").await?;
        assert_eq!(state.status, RolloutStatus::Error);
        assert_eq!(
            state.failure.as_ref().map(|f| f.kind),
            Some(ErrorKind::TransientAgent)
        );
        Ok(())
    }

    #[tokio::test]
    async fn fatal_agent_failure_is_terminal() -> Result<()> {
        let engine = Fixture::new().build();
        let agent = ScriptedAgent::new("broken", vec![ScriptStep::fatal("unparseable output")]);
        let (_, state, events) = run(&engine, agent, "parse this").await?;

        assert_eq!(state.status, RolloutStatus::Error);
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
        Ok(())
    }

    #[tokio::test]
    async fn runtime_timeout_fulfils_the_call_and_continues() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.runtime = Arc::new(EchoRuntime::new().with_latency(Duration::from_millis(500)));
        fixture.config.runtime_timeout_ms = 20;
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "patient",
            [
                Action::ToolCall(ToolCall::new("sleep", json!({"secs": 10}))),
                Action::finish(json!("gave up waiting")),
            ],
        );

        let (_, state, events) = run(&engine, agent, "wait").await?;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert_eq!(events[2].cause_id, Some(1));
        assert_eq!(
            events[2].as_observation(),
            Some(&Observation::Cancelled {
                reason: CancelReason::Timeout
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn transient_runtime_failures_are_retried() -> Result<()> {
        let mut fixture = Fixture::new();
        let runtime = Arc::new(EchoRuntime::new().failing_first(2));
        fixture.runtime = runtime.clone();
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "coder",
            [Action::ToolCall(ToolCall::new("build", json!({})))],
        );

        let (_, state, _) = run(&engine, agent, "build it").await?;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert_eq!(runtime.calls(), 3);
        assert_eq!(state.metrics.retries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_during_execution_records_requested_cancel() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.runtime = Arc::new(EchoRuntime::new().with_latency(Duration::from_secs(30)));
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "slow",
            [Action::ToolCall(ToolCall::new("train", json!({})))],
        );
        let spec = RolloutSpec::new(Arc::new(agent), "train a model");
        let rollout_id = spec.rollout_id.clone();
        let mut events = engine.log().subscribe(&rollout_id, 0).await?;
        let controller = engine.launch(spec, CancellationToken::new()).await?;
        let cancel = controller.cancel_token();
        let handle = tokio::spawn(controller.run());

        while let Some(event) = events.recv().await {
            if matches!(event.as_action(), Some(Action::ToolCall(_))) {
                break;
            }
        }
        cancel.cancel();

        let state = tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(state.status, RolloutStatus::Cancelled);
        let log = engine.log().read_all(&rollout_id).await?;
        let last = log.last().unwrap();
        assert_eq!(last.cause_id, Some(1));
        assert_eq!(
            last.as_observation(),
            Some(&Observation::Cancelled {
                reason: CancelReason::Requested
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_call_never_reaches_the_runtime() -> Result<()> {
        let mut fixture = Fixture::new();
        let runtime = Arc::new(EchoRuntime::new());
        fixture.runtime = runtime.clone();
        fixture.confirmation = ConfirmationPolicy::gating(["shell*"]);
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "operator",
            [
                Action::ToolCall(ToolCall::new("shell", json!({"cmd": "rm -rf /"}))),
                Action::finish(json!("stood down")),
            ],
        );
        let spec = RolloutSpec::new(Arc::new(agent), "clean up");
        let rollout_id = spec.rollout_id.clone();
        let mut events = engine.log().subscribe(&rollout_id, 0).await?;
        let controller = engine.launch(spec, CancellationToken::new()).await?;
        let handle = tokio::spawn(controller.run());

        let target = loop {
            let event = events.recv().await.unwrap();
            if let Some(Action::ToolCall(call)) = event.as_action() {
                assert!(call.requires_confirmation);
                break event.id;
            }
        };
        engine
            .log()
            .append(EventDraft::action(
                rollout_id.clone(),
                EventSource::User,
                Action::ConfirmationResponse {
                    target,
                    decision: ConfirmationDecision::Rejected,
                    reason: Some("too dangerous".into()),
                },
            ))
            .await?;

        let state = handle.await??;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert_eq!(runtime.calls(), 0);
        let log = engine.log().read_all(&rollout_id).await?;
        let rejected = log
            .iter()
            .find(|e| matches!(e.as_observation(), Some(Observation::Rejected { .. })))
            .unwrap();
        assert_eq!(rejected.cause_id, Some(target));
        validate_log(&rollout_id, &log)?;
        Ok(())
    }

    #[tokio::test]
    async fn delegation_folds_child_outputs_into_parent() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.registry = AgentRegistry::new().with(
            "researcher",
            Arc::new(ScriptedAgent::from_actions(
                "researcher",
                [Action::finish(json!({"findings": 3}))],
            )),
        );
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "lead",
            [
                Action::Delegate {
                    agent: "researcher".into(),
                    task: "survey prior work".into(),
                },
                Action::finish(json!("done")),
            ],
        );

        let (rollout_id, state, events) = run(&engine, agent, "write a report").await?;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert_eq!(state.metrics.delegations, 1);

        let Some(Observation::DelegateResult { child, outputs, .. }) = events[2].as_observation()
        else {
            panic!("expected delegate result, got {:?}", events[2]);
        };
        assert_eq!(outputs, &json!({"findings": 3}));
        let tree = engine.delegates().tree();
        assert_eq!(tree.children(&rollout_id), vec![child.clone()]);
        let node = tree.get(child).unwrap();
        assert_eq!(node.depth, 1);
        assert_eq!(node.status, RolloutStatus::Finished);

        let child_log = engine.log().read_all(child).await?;
        assert_eq!(
            child_log[0].as_action(),
            Some(&Action::message("survey prior work"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn delegation_beyond_max_depth_is_an_observation() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.max_depth = 0;
        fixture.registry = AgentRegistry::new().with(
            "helper",
            Arc::new(ScriptedAgent::new("helper", Vec::new())),
        );
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "lead",
            [Action::Delegate {
                agent: "helper".into(),
                task: "anything".into(),
            }],
        );

        let (rollout_id, state, events) = run(&engine, agent, "go deep").await?;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert!(matches!(
            events[2].as_observation(),
            Some(Observation::DelegateError {
                error: ErrorKind::DelegationDepthExceeded,
                child: None,
                ..
            })
        ));
        assert!(engine.delegates().tree().children(&rollout_id).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn recall_is_answered_inline() -> Result<()> {
        let mut fixture = Fixture::new();
        let k8s: Arc<dyn KnowledgeProvider> = Arc::new(StaticKnowledgeProvider::new(
            "k8s",
            ["kubernetes"],
            "pods are cattle",
        ));
        fixture.providers = ProviderSet::new(vec![k8s])?;
        let engine = fixture.build();
        let agent = ScriptedAgent::from_actions(
            "ops",
            [Action::Recall {
                recall: RecallKind::Knowledge,
                query: "Kubernetes security".into(),
            }],
        );

        let (_, state, events) = run(&engine, agent, "harden cluster").await?;
        assert_eq!(state.metrics.recalls, 1);
        let Some(Observation::RecallResult { fragments, .. }) = events[2].as_observation() else {
            panic!("expected recall result");
        };
        assert_eq!(fragments[0].content, "pods are cattle");
        assert_eq!(events[2].cause_id, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn long_rollouts_condense_lazily() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.condenser.max_size = 10;
        let engine = fixture.build();
        let mut actions: Vec<Action> = (0..30).map(|i| Action::message(format!("note {i}"))).collect();
        actions.push(Action::finish(json!(null)));
        let agent = ScriptedAgent::from_actions("writer", actions);

        let (rollout_id, state, events) = run(&engine, agent, "take notes").await?;
        assert_eq!(state.status, RolloutStatus::Finished);
        assert!(state.metrics.condensations >= 2);
        assert!(state.view.len() <= 11);
        assert_eq!(state.view.first().map(|e| e.id), Some(0));
        validate_log(&rollout_id, &events)?;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_framing_finishes_truncated_without_calling_the_agent() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.condenser.max_tokens = Some(3);
        let engine = fixture.build();
        let agent = Arc::new(ScriptedAgent::from_actions("reader", [Action::finish(json!(1))]));
        let spec = RolloutSpec::new(
            agent.clone(),
            "read the entire monorepo and explain every module in detail",
        );
        let rollout_id = spec.rollout_id.clone();
        let state = engine.launch(spec, CancellationToken::new()).await?.run().await?;

        assert_eq!(state.status, RolloutStatus::Finished);
        assert!(state.truncated);
        assert_eq!(agent.calls(), 0);
        let events = engine.log().read_all(&rollout_id).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].source, EventSource::Environment);
        assert!(matches!(
            events[1].as_action(),
            Some(Action::Finish {
                truncation: Some(TruncationReason::ContextBudgetExceeded),
                ..
            })
        ));
        Ok(())
    }

    /// Scores every step at 0.5 and ends the episode on the second call.
    #[derive(Default)]
    struct ScoringRuntime {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl Runtime for ScoringRuntime {
        async fn execute(
            &self,
            request: ExecutionRequest,
        ) -> Result<ExecutionReport, RuntimeError> {
            let step = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(ExecutionReport::ok(request.call.tool_name)
                .with_reward(0.5, step == 2)
                .with_metadata(json!({"step": step})))
        }
    }

    #[tokio::test]
    async fn runtime_rewards_are_recorded_and_end_the_episode() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.runtime = Arc::new(ScoringRuntime::default());
        let engine = fixture.build();
        let agent = Arc::new(
            ScriptedAgent::from_actions("player", [Action::ToolCall(ToolCall::new("move", json!({})))])
                .repeating(),
        );
        let spec = RolloutSpec::new(agent.clone(), "reach the goal");
        let rollout_id = spec.rollout_id.clone();
        let state = engine.launch(spec, CancellationToken::new()).await?.run().await?;

        assert_eq!(state.status, RolloutStatus::Finished);
        assert!(!state.truncated);
        assert_eq!(state.reward, 1.0);
        assert_eq!(agent.calls(), 2);

        let events = engine.log().read_all(&rollout_id).await?;
        let Some(Observation::ToolResult {
            reward,
            done,
            metadata,
            ..
        }) = events[4].as_observation()
        else {
            panic!("expected the second tool result, got {:?}", events[4]);
        };
        assert_eq!((*reward, *done), (Some(0.5), true));
        assert_eq!(metadata, &json!({"step": 2}));
        let last = events.last().unwrap();
        assert_eq!(last.source, EventSource::Environment);
        assert_eq!(
            last.as_action(),
            Some(&Action::Finish {
                outputs: json!(null),
                truncation: None,
            })
        );
        validate_log(&rollout_id, &events)?;
        Ok(())
    }

    #[tokio::test]
    async fn relaunching_a_finished_rollout_appends_nothing() -> Result<()> {
        let engine = Fixture::new().build();
        let agent = Arc::new(ScriptedAgent::from_actions("once", [Action::finish(json!(1))]));
        let spec = RolloutSpec::new(agent.clone(), "once");
        let rollout_id = spec.rollout_id.clone();
        engine.launch(spec.clone(), CancellationToken::new()).await?.run().await?;
        let before = engine.log().read_all(&rollout_id).await?;

        let resumed = engine.launch(spec, CancellationToken::new()).await?;
        assert_eq!(resumed.state().status, RolloutStatus::Finished);
        let state = resumed.run().await?;
        assert_eq!(state.outputs, Some(json!(1)));
        assert_eq!(engine.log().read_all(&rollout_id).await?, before);
        assert_eq!(agent.calls(), 1);
        Ok(())
    }
}
