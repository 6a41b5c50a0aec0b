use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tiller_kernel::{Kernel, KernelBuilder, RolloutRequest, TillerConfig};
use tiller_protocol::{
    Action, CancelReason, ErrorKind, EventSource, ExecutionReport, ExecutionRequest,
    Observation, RecallKind, RolloutId, RolloutStatus, Runtime, RuntimeError, ToolCall,
    TrajectoryQuery, View, validate_log,
};
use tiller_runtime::{EchoRuntime, ScriptedAgent};

fn unique_test_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("{name}-{nanos}"))
}

/// Records how many executions overlap.
#[derive(Default)]
struct GaugeRuntime {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Runtime for GaugeRuntime {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, RuntimeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionReport::ok(request.call.tool_name))
    }
}

fn worker_agent(name: &str) -> Arc<ScriptedAgent> {
    Arc::new(ScriptedAgent::from_actions(
        name,
        [
            Action::ToolCall(ToolCall::new("compile", json!({}))),
            Action::finish(json!("built")),
        ],
    ))
}

async fn batch_of_four(max_workers: usize) -> Result<(Kernel, Arc<GaugeRuntime>, Vec<RolloutId>)> {
    let runtime = Arc::new(GaugeRuntime::default());
    let mut config = TillerConfig::default();
    config.pool.max_workers = max_workers;
    let kernel = KernelBuilder::new(unique_test_root("tiller-batch"))
        .config(config)
        .runtime(runtime.clone())
        .agent("builder", worker_agent("builder"))
        .build()
        .await?;

    let requests = (0..4)
        .map(|index| RolloutRequest::new("builder", format!("build crate {index}")))
        .collect();
    let mut ids = Vec::new();
    for outcome in kernel.run_batch(requests).await {
        let outcome = outcome?;
        assert_eq!(outcome.state.status, RolloutStatus::Finished);
        ids.push(outcome.state.rollout_id);
    }
    Ok((kernel, runtime, ids))
}

#[tokio::test]
async fn four_concurrent_rollouts_keep_independent_dense_logs() -> Result<()> {
    let (kernel, runtime, ids) = batch_of_four(4).await?;
    assert!(runtime.peak.load(Ordering::SeqCst) >= 2);

    for rollout_id in &ids {
        let events = kernel.read_events(rollout_id, 0, None).await?;
        let event_ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(event_ids, (0..events.len() as u64).collect::<Vec<_>>());
        assert!(events.iter().all(|e| &e.rollout_id == rollout_id));
        validate_log(rollout_id, &events)?;
    }
    Ok(())
}

#[tokio::test]
async fn pool_bounds_parallel_workers() -> Result<()> {
    let (_, runtime, ids) = batch_of_four(2).await?;
    assert_eq!(ids.len(), 4);
    assert!(runtime.peak.load(Ordering::SeqCst) <= 2);
    Ok(())
}

#[tokio::test]
async fn batch_outcomes_keep_request_order_and_isolate_failures() -> Result<()> {
    let kernel = KernelBuilder::new(unique_test_root("tiller-batch-order"))
        .runtime(Arc::new(EchoRuntime::new()))
        .agent("builder", worker_agent("builder"))
        .build()
        .await?;
    let first = RolloutId::from_string("first");
    let outcomes = kernel
        .run_batch(vec![
            RolloutRequest::new("builder", "a").with_id(first.clone()),
            RolloutRequest::new("nobody", "b"),
            RolloutRequest::new("builder", "c"),
        ])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].as_ref().map(|o| &o.state.rollout_id).ok(), Some(&first));
    assert!(outcomes[1].is_err());
    assert!(outcomes[2].is_ok());
    Ok(())
}

#[tokio::test]
async fn iteration_cap_of_five() -> Result<()> {
    let mut config = TillerConfig::default();
    config.controller.max_iterations = 5;
    let kernel = KernelBuilder::new(unique_test_root("tiller-cap"))
        .config(config)
        .runtime(Arc::new(EchoRuntime::new()))
        .agent(
            "looper",
            Arc::new(
                ScriptedAgent::from_actions("looper", [Action::message("one more thought")])
                    .repeating(),
            ),
        )
        .build()
        .await?;

    let outcome = kernel
        .start(RolloutRequest::new("looper", "think forever"))?
        .wait()
        .await?;
    assert_eq!(outcome.state.status, RolloutStatus::Finished);
    assert!(outcome.state.truncated);

    let events = kernel.read_events(&outcome.state.rollout_id, 0, None).await?;
    let agent_events = events.iter().filter(|e| e.source == EventSource::Agent).count();
    assert_eq!(agent_events, 5);
    Ok(())
}

#[tokio::test]
async fn cancel_mid_execution_records_one_terminal_event() -> Result<()> {
    let root = unique_test_root("tiller-cancel");
    let kernel = KernelBuilder::new(&root)
        .runtime(Arc::new(EchoRuntime::new().with_latency(Duration::from_secs(60))))
        .agent(
            "slow",
            Arc::new(ScriptedAgent::from_actions(
                "slow",
                [Action::ToolCall(ToolCall::new("migrate", json!({})))],
            )),
        )
        .build()
        .await?;

    let rollout_id = RolloutId::from_string("to-cancel");
    let mut events = kernel.subscribe(&rollout_id, 0).await?;
    let handle = kernel.start(RolloutRequest::new("slow", "migrate db").with_id(rollout_id.clone()))?;
    while let Some(event) = events.recv().await {
        if matches!(event.as_action(), Some(Action::ToolCall(_))) {
            break;
        }
    }
    assert!(kernel.cancel(&rollout_id));

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await??;
    assert_eq!(outcome.state.status, RolloutStatus::Cancelled);

    let log = kernel.read_events(&rollout_id, 0, None).await?;
    let cancels: Vec<_> = log
        .iter()
        .filter(|e| {
            e.as_observation()
                == Some(&Observation::Cancelled {
                    reason: CancelReason::Requested,
                })
        })
        .collect();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].id, log.last().unwrap().id);
    assert!(!kernel.cancel(&rollout_id));

    let archived = kernel.trajectory(&outcome.trajectory_id.unwrap()).await?;
    assert_eq!(archived.status, RolloutStatus::Cancelled);
    Ok(())
}

#[tokio::test]
async fn confirmation_releases_the_gated_call() -> Result<()> {
    let runtime = Arc::new(EchoRuntime::new());
    let mut config = TillerConfig::default();
    config.confirmation.gate = vec!["deploy*".to_owned()];
    let kernel = KernelBuilder::new(unique_test_root("tiller-confirm"))
        .config(config)
        .runtime(runtime.clone())
        .agent(
            "shipper",
            Arc::new(ScriptedAgent::from_actions(
                "shipper",
                [
                    Action::ToolCall(ToolCall::new("deploy.prod", json!({"version": "1.2"}))),
                    Action::finish(json!("shipped")),
                ],
            )),
        )
        .build()
        .await?;

    let rollout_id = RolloutId::from_string("ship-it");
    let mut events = kernel.subscribe(&rollout_id, 0).await?;
    let handle = kernel.start(RolloutRequest::new("shipper", "ship").with_id(rollout_id.clone()))?;
    let target = loop {
        let event = events.recv().await.unwrap();
        if matches!(event.as_action(), Some(Action::ToolCall(_))) {
            break event.id;
        }
    };
    assert!(kernel.confirm(&rollout_id, target + 1).await.is_err());
    kernel.confirm(&rollout_id, target).await?;

    let outcome = handle.wait().await?;
    assert_eq!(outcome.state.status, RolloutStatus::Finished);
    assert_eq!(runtime.calls(), 1);
    assert!(kernel.confirm(&rollout_id, target).await.is_err());
    Ok(())
}

#[tokio::test]
async fn knowledge_dir_recall_matches_kubernetes_security() -> Result<()> {
    let root = unique_test_root("tiller-recall");
    let knowledge = root.join("knowledge");
    tokio::fs::create_dir_all(&knowledge).await?;
    for (file, triggers, body) in [
        ("a-k8s.md", r#"["kubernetes", "kubectl"]"#, "Prefer namespaces per team."),
        ("b-docker.md", r#"["dockerfile"]"#, "Pin base images."),
        ("c-security.md", r#"["security"]"#, "Rotate credentials."),
    ] {
        let raw = format!("+++\ntriggers = {triggers}\n+++\n{body}\n");
        tokio::fs::write(knowledge.join(file), raw).await?;
    }

    let mut config = TillerConfig::default();
    config.recall.knowledge_dir = Some(knowledge);
    let kernel = KernelBuilder::new(&root)
        .config(config)
        .runtime(Arc::new(EchoRuntime::new()))
        .agent(
            "ops",
            Arc::new(ScriptedAgent::from_actions(
                "ops",
                [Action::Recall {
                    recall: RecallKind::Knowledge,
                    query: "kubernetes security".into(),
                }],
            )),
        )
        .build()
        .await?;

    let outcome = kernel.start(RolloutRequest::new("ops", "audit"))?.wait().await?;
    let events = kernel.read_events(&outcome.state.rollout_id, 0, None).await?;
    let Some(Observation::RecallResult { fragments, .. }) = events[2].as_observation() else {
        panic!("expected a recall result, got {:?}", events[2]);
    };
    let providers: Vec<&str> = fragments.iter().map(|f| f.provider.as_str()).collect();
    assert_eq!(providers, vec!["a-k8s", "c-security"]);
    Ok(())
}

#[tokio::test]
async fn condensed_views_replay_identically() -> Result<()> {
    let root = unique_test_root("tiller-condense");
    let mut config = TillerConfig::default();
    config.condenser.keep_first = 1;
    config.condenser.max_size = 10;
    let mut script: Vec<Action> = (0..24).map(|i| Action::message(format!("step {i}"))).collect();
    script.push(Action::finish(json!("ok")));
    let kernel = KernelBuilder::new(&root)
        .config(config.clone())
        .runtime(Arc::new(EchoRuntime::new()))
        .agent("long", Arc::new(ScriptedAgent::from_actions("long", script)))
        .build()
        .await?;

    let outcome = kernel.start(RolloutRequest::new("long", "go on"))?.wait().await?;
    let rollout_id = outcome.state.rollout_id.clone();
    assert!(outcome.state.metrics.condensations > 0);
    assert!(outcome.state.view.len() <= 11);
    assert_eq!(outcome.state.view.first().map(|e| e.id), Some(0));
    assert!(outcome.state.view.iter().any(View::is_condensed_marker));

    // A fresh kernel over the same root rebuilds the same state.
    let reopened = KernelBuilder::new(&root)
        .config(config)
        .runtime(Arc::new(EchoRuntime::new()))
        .build()
        .await?;
    assert_eq!(reopened.state(&rollout_id).await?, outcome.state);
    assert_eq!(reopened.get_view(&rollout_id, None).await?, outcome.state.view);

    let events = reopened.read_events(&rollout_id, 0, None).await?;
    let midpoint = events[events.len() / 2].id;
    let as_of = reopened.get_view(&rollout_id, Some(midpoint)).await?;
    assert!(as_of.iter().all(|e| e.id <= midpoint));
    assert_eq!(as_of, View::as_of(&events, midpoint));
    Ok(())
}

#[tokio::test]
async fn delegation_depth_is_bounded() -> Result<()> {
    let mut config = TillerConfig::default();
    config.delegation.max_depth = 1;
    let delegate_to = |agent: &str| Action::Delegate {
        agent: agent.to_owned(),
        task: format!("help from {agent}"),
    };
    let kernel = KernelBuilder::new(unique_test_root("tiller-delegation"))
        .config(config)
        .runtime(Arc::new(EchoRuntime::new()))
        .agent(
            "lead",
            Arc::new(ScriptedAgent::from_actions("lead", [delegate_to("mid")])),
        )
        .agent(
            "mid",
            Arc::new(ScriptedAgent::from_actions("mid", [delegate_to("leaf")])),
        )
        .agent("leaf", Arc::new(ScriptedAgent::from_actions("leaf", [])))
        .build()
        .await?;

    let lead_id = RolloutId::from_string("lead-plan");
    let outcome = kernel
        .start(
            RolloutRequest::new("lead", "plan")
                .with_id(lead_id.clone())
                .with_label("planning")
                .with_metadata(json!({"ticket": 12})),
        )?
        .wait()
        .await?;
    assert_eq!(outcome.state.status, RolloutStatus::Finished);
    assert!(kernel.delegation_tree().is_empty());

    let children = kernel
        .trajectories(&TrajectoryQuery::children_of(lead_id.clone()))
        .await?;
    assert_eq!(children.len(), 1);
    let mid = &children[0];
    assert_eq!(mid.parent_id.as_ref(), Some(&lead_id));
    assert_eq!(mid.label, "planning");
    assert_eq!(mid.metadata, json!({"ticket": 12}));
    assert_eq!(mid.status, RolloutStatus::Finished);
    assert!(mid.events.iter().any(|e| matches!(
        e.as_observation(),
        Some(Observation::DelegateError {
            error: ErrorKind::DelegationDepthExceeded,
            ..
        })
    )));
    // The leaf was refused, so nothing ran beneath the middle rollout.
    assert!(kernel
        .trajectories(&TrajectoryQuery::children_of(mid.rollout_id.clone()))
        .await?
        .is_empty());

    let lead_log = kernel.read_events(&lead_id, 0, None).await?;
    assert!(matches!(
        lead_log[2].as_observation(),
        Some(Observation::DelegateResult { child, .. }) if child == &mid.rollout_id
    ));
    let roots = kernel.trajectories(&TrajectoryQuery::label("planning")).await?;
    assert_eq!(roots.len(), 2);
    assert_eq!(
        roots.iter().filter(|t| t.parent_id.is_none()).count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn restarting_an_ended_rollout_keeps_one_trajectory() -> Result<()> {
    let kernel = KernelBuilder::new(unique_test_root("tiller-restart-ended"))
        .runtime(Arc::new(EchoRuntime::new()))
        .agent("builder", worker_agent("builder"))
        .build()
        .await?;
    let rollout_id = RolloutId::from_string("built-once");
    let request = RolloutRequest::new("builder", "job").with_id(rollout_id.clone());

    let first = kernel.start(request.clone())?.wait().await?;
    let second = kernel.start(request)?.wait().await?;

    assert_eq!(second.state.status, RolloutStatus::Finished);
    assert_eq!(second.state.last_event, first.state.last_event);
    assert!(first.trajectory_id.is_some());
    assert_eq!(second.trajectory_id, first.trajectory_id);
    assert_eq!(kernel.trajectories(&TrajectoryQuery::default()).await?.len(), 1);
    assert!(kernel.delegation_tree().is_empty());
    Ok(())
}

/// Pays 0.5 per call and ends the episode on the second one.
#[derive(Default)]
struct BanditRuntime {
    pulls: AtomicUsize,
}

#[async_trait]
impl Runtime for BanditRuntime {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, RuntimeError> {
        let pull = self.pulls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExecutionReport::ok(format!("{} paid out", request.call.tool_name))
            .with_reward(0.5, pull == 2)
            .with_metadata(json!({"pull": pull})))
    }
}

#[tokio::test]
async fn episode_reward_is_archived_with_the_trajectory() -> Result<()> {
    let kernel = KernelBuilder::new(unique_test_root("tiller-reward"))
        .runtime(Arc::new(BanditRuntime::default()))
        .agent(
            "gambler",
            Arc::new(
                ScriptedAgent::from_actions(
                    "gambler",
                    [Action::ToolCall(ToolCall::new("lever", json!({})))],
                )
                .repeating(),
            ),
        )
        .build()
        .await?;

    let outcome = kernel
        .start(RolloutRequest::new("gambler", "pull the lever").with_label("bandit"))?
        .wait()
        .await?;
    assert_eq!(outcome.state.status, RolloutStatus::Finished);
    assert_eq!(outcome.state.reward, 1.0);

    let trajectory = kernel.trajectory(&outcome.trajectory_id.unwrap()).await?;
    assert_eq!(trajectory.reward, 1.0);
    assert!(!trajectory.truncated);
    let last = trajectory.events.last().unwrap();
    assert_eq!(last.source, EventSource::Environment);
    assert!(trajectory.events.iter().any(|e| matches!(
        e.as_observation(),
        Some(Observation::ToolResult { metadata, .. }) if metadata == &json!({"pull": 2})
    )));
    validate_log(&outcome.state.rollout_id, &trajectory.events)?;
    Ok(())
}

#[tokio::test]
async fn global_subscription_sees_every_rollout_in_order() -> Result<()> {
    let kernel = KernelBuilder::new(unique_test_root("tiller-global"))
        .runtime(Arc::new(EchoRuntime::new()))
        .agent("builder", worker_agent("builder"))
        .build()
        .await?;
    let mut all = kernel.subscribe_all();

    let outcomes = kernel
        .run_batch(vec![
            RolloutRequest::new("builder", "x"),
            RolloutRequest::new("builder", "y"),
        ])
        .await;
    let mut expected = 0;
    for outcome in &outcomes {
        let outcome = outcome.as_ref().unwrap();
        expected += kernel.read_events(&outcome.state.rollout_id, 0, None).await?.len();
    }

    let mut last_seen: HashMap<RolloutId, u64> = HashMap::new();
    for _ in 0..expected {
        let event = all.recv().await.unwrap();
        if let Some(previous) = last_seen.insert(event.rollout_id.clone(), event.id) {
            assert!(event.id > previous);
        }
    }
    assert_eq!(last_seen.len(), 2);
    Ok(())
}

#[tokio::test]
async fn archived_trajectories_are_listed_newest_first() -> Result<()> {
    let kernel = KernelBuilder::new(unique_test_root("tiller-archive-list"))
        .runtime(Arc::new(EchoRuntime::new()))
        .agent("builder", worker_agent("builder"))
        .build()
        .await?;
    for label in ["swe", "swe", "web"] {
        kernel
            .start(RolloutRequest::new("builder", "job").with_label(label))?
            .wait()
            .await?;
    }

    let swe = kernel.trajectories(&TrajectoryQuery::label("swe")).await?;
    assert_eq!(swe.len(), 2);
    assert!(swe[0].saved_at >= swe[1].saved_at);
    assert_eq!(kernel.trajectories(&TrajectoryQuery::default()).await?.len(), 3);
    Ok(())
}
