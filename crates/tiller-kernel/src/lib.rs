//! The tiller kernel: wires the event log, condenser, recall and controller
//! together behind one handle, runs rollouts on a bounded worker pool and
//! archives finished rollouts as trajectories.

mod config;
mod pool;
mod trajectory;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tiller_condenser::{Condenser, Summarizer};
use tiller_events::{EventLog, EventStore, FileEventStore, Subscription};
use tiller_protocol::{
    Action, Agent, ConfirmationDecision, Event, EventDraft, EventId, EventSource,
    KnowledgeProvider, RolloutId, RolloutState, RolloutStatus, Runtime, Trajectory, TrajectoryId,
    TrajectoryQuery, TrajectoryStore, View,
};
use tiller_recall::{ProviderSet, RecallCoordinator, load_knowledge_dir};
use tiller_runtime::{AgentRegistry, DelegateManager, DelegationNode, Engine, RolloutSpec};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use config::{
    ConfigError, DelegationConfig, LogConfig, LogFormat, PoolConfig, TillerConfig,
    TrajectoryConfig,
};
pub use pool::RolloutPool;
pub use trajectory::{FileTrajectoryStore, build_trajectory, content_hash};

pub struct KernelBuilder {
    root: PathBuf,
    config: TillerConfig,
    runtime: Option<Arc<dyn Runtime>>,
    agents: AgentRegistry,
    providers: Vec<Arc<dyn KnowledgeProvider>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    event_store: Option<Arc<dyn EventStore>>,
    trajectory_store: Option<Arc<dyn TrajectoryStore>>,
}

impl KernelBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: TillerConfig::default(),
            runtime: None,
            agents: AgentRegistry::new(),
            providers: Vec::new(),
            summarizer: None,
            event_store: None,
            trajectory_store: None,
        }
    }

    pub fn config(mut self, config: TillerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Register an agent under `name`, for `start` requests and delegation.
    pub fn agent(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.agents = self.agents.with(name, agent);
        self
    }

    pub fn knowledge_provider(mut self, provider: Arc<dyn KnowledgeProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Replace the default `<root>/events` JSONL store.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn trajectory_store(mut self, store: Arc<dyn TrajectoryStore>) -> Self {
        self.trajectory_store = Some(store);
        self
    }

    /// Validate the config, load the knowledge directory and assemble the
    /// engine. The provider set is frozen from here on.
    pub async fn build(self) -> Result<Kernel> {
        let config = self.config;
        config.validate()?;
        let runtime = self.runtime.context("kernel needs a runtime")?;

        let store = self
            .event_store
            .unwrap_or_else(|| Arc::new(FileEventStore::new(self.root.clone())) as Arc<dyn EventStore>);
        let log = EventLog::new(store);

        let mut providers = self.providers;
        if let Some(dir) = &config.recall.knowledge_dir {
            let loaded = load_knowledge_dir(dir).await?;
            info!(dir = %dir.display(), providers = loaded.len(), "loaded knowledge directory");
            providers.extend(
                loaded
                    .into_iter()
                    .map(|provider| Arc::new(provider) as Arc<dyn KnowledgeProvider>),
            );
        }
        let recall = RecallCoordinator::new(Arc::new(ProviderSet::new(providers)?), &config.recall);

        let mut condenser = Condenser::new(config.condenser.clone())?;
        if let Some(summarizer) = self.summarizer {
            condenser = condenser.with_summarizer(summarizer);
        }

        let delegates = DelegateManager::new(self.agents, config.delegation.max_depth);
        let engine = Engine::new(log, runtime, condenser, recall, delegates)
            .with_config(config.controller.clone())
            .with_retry(config.retry.clone())
            .with_confirmation(config.confirmation.clone());

        let trajectories = match self.trajectory_store {
            Some(store) => Some(store),
            None if config.trajectories.enabled => Some(Arc::new(FileTrajectoryStore::new(
                config.trajectory_dir(&self.root),
            )) as Arc<dyn TrajectoryStore>),
            None => None,
        };

        Ok(Kernel {
            engine: Arc::new(engine),
            pool: RolloutPool::new(config.pool.max_workers),
            trajectories,
            default_label: config.trajectories.default_label.clone(),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

/// What to run: a task for a registered agent.
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub agent: String,
    pub task: String,
    pub rollout_id: Option<RolloutId>,
    /// Trajectory label. Falls back to `[trajectories].default_label`.
    pub label: Option<String>,
    pub metadata: Value,
}

impl RolloutRequest {
    pub fn new(agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task: task.into(),
            rollout_id: None,
            label: None,
            metadata: Value::Null,
        }
    }

    pub fn with_id(mut self, rollout_id: RolloutId) -> Self {
        self.rollout_id = Some(rollout_id);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RolloutOutcome {
    pub state: RolloutState,
    /// Set when the rollout was archived.
    pub trajectory_id: Option<TrajectoryId>,
}

/// A started rollout. Dropping the handle does not stop the rollout.
#[derive(Debug)]
pub struct RolloutHandle {
    rollout_id: RolloutId,
    cancel: CancellationToken,
    join: JoinHandle<Result<RolloutOutcome>>,
}

impl RolloutHandle {
    pub fn rollout_id(&self) -> &RolloutId {
        &self.rollout_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<RolloutOutcome> {
        self.join
            .await
            .with_context(|| format!("rollout {} worker aborted", self.rollout_id))?
    }
}

#[derive(Clone)]
pub struct Kernel {
    engine: Arc<Engine>,
    pool: RolloutPool,
    trajectories: Option<Arc<dyn TrajectoryStore>>,
    default_label: String,
    running: Arc<Mutex<HashMap<RolloutId, CancellationToken>>>,
}

impl Kernel {
    pub fn pool(&self) -> &RolloutPool {
        &self.pool
    }

    /// Queue a rollout on the pool. A request naming an existing rollout id
    /// resumes that rollout from its log.
    #[instrument(skip(self, request), fields(agent = %request.agent))]
    pub fn start(&self, request: RolloutRequest) -> Result<RolloutHandle> {
        let agent = self
            .engine
            .delegates()
            .registry()
            .get(&request.agent)
            .with_context(|| format!("no agent registered as {:?}", request.agent))?;

        let mut spec = RolloutSpec::new(agent, request.task);
        spec.agent_name = request.agent;
        if let Some(rollout_id) = request.rollout_id {
            spec = spec.with_id(rollout_id);
        }
        let rollout_id = spec.rollout_id.clone();

        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(&rollout_id) {
                bail!("rollout {rollout_id} is already running");
            }
            running.insert(rollout_id.clone(), cancel.clone());
        }

        let label = request.label.unwrap_or_else(|| self.default_label.clone());
        let kernel = self.clone();
        let worker_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let rollout_id = spec.rollout_id.clone();
            let outcome = kernel.drive(spec, worker_cancel, label, request.metadata).await;
            kernel.running.lock().remove(&rollout_id);
            if let Err(error) = &outcome {
                warn!(%rollout_id, error = %format!("{error:#}"), "rollout worker failed");
            }
            outcome
        });

        info!(%rollout_id, "rollout queued");
        Ok(RolloutHandle {
            rollout_id,
            cancel,
            join,
        })
    }

    async fn drive(
        &self,
        spec: RolloutSpec,
        cancel: CancellationToken,
        label: String,
        metadata: Value,
    ) -> Result<RolloutOutcome> {
        // A rollout cancelled while queued still launches, so the cancel
        // lands in its log.
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.pool.acquire() => Some(permit?),
        };
        let controller = self.engine.launch(spec, cancel).await?;
        let already_ended = controller.state().status.is_terminal();
        let state = controller.run().await?;
        let subtree = self
            .engine
            .delegates()
            .tree()
            .remove_subtree(&state.rollout_id);

        let trajectory_id = if already_ended {
            self.archived(&state.rollout_id).await
        } else {
            self.archive(&state, &subtree, label, metadata).await
        };
        Ok(RolloutOutcome {
            state,
            trajectory_id,
        })
    }

    /// Archive a finished root and, under the same label and metadata, every
    /// delegated rollout beneath it. Best effort: failures are logged, never
    /// surfaced.
    async fn archive(
        &self,
        state: &RolloutState,
        subtree: &[(RolloutId, DelegationNode)],
        label: String,
        metadata: Value,
    ) -> Option<TrajectoryId> {
        let store = self.trajectories.as_ref()?;
        for (child_id, node) in subtree.iter().filter(|(id, _)| id != &state.rollout_id) {
            let saved = async {
                let events = self.engine.log().read_all(child_id).await?;
                let child = RolloutState::replay(child_id.clone(), &events);
                let trajectory = build_trajectory(
                    &child,
                    events,
                    label.clone(),
                    node.parent.clone(),
                    metadata.clone(),
                )?;
                anyhow::Ok(store.save(&trajectory).await?)
            };
            if let Err(error) = saved.await {
                warn!(rollout_id = %child_id, error = %format!("{error:#}"), "failed to archive child trajectory");
            }
        }

        let saved = async {
            let events = self.engine.log().read_all(&state.rollout_id).await?;
            let trajectory = build_trajectory(state, events, label, None, metadata)?;
            anyhow::Ok(store.save(&trajectory).await?)
        };
        match saved.await {
            Ok(trajectory_id) => {
                info!(
                    rollout_id = %state.rollout_id,
                    %trajectory_id,
                    children = subtree.len().saturating_sub(1),
                    "trajectory archived"
                );
                Some(trajectory_id)
            }
            Err(error) => {
                warn!(rollout_id = %state.rollout_id, error = %format!("{error:#}"), "failed to archive trajectory");
                None
            }
        }
    }

    /// Trajectory saved when the rollout first ended. Resuming an ended
    /// rollout never archives it twice.
    async fn archived(&self, rollout_id: &RolloutId) -> Option<TrajectoryId> {
        let store = self.trajectories.as_ref()?;
        let query = TrajectoryQuery {
            rollout_id: Some(rollout_id.clone()),
            limit: 1,
            ..TrajectoryQuery::default()
        };
        match store.list(&query).await {
            Ok(found) => found.into_iter().next().map(|trajectory| trajectory.trajectory_id),
            Err(error) => {
                warn!(%rollout_id, %error, "failed to look up archived trajectory");
                None
            }
        }
    }

    /// Start every request and wait for all of them. Outcomes come back in
    /// request order; one failure does not affect the others.
    pub async fn run_batch(&self, requests: Vec<RolloutRequest>) -> Vec<Result<RolloutOutcome>> {
        let handles: Vec<Result<RolloutHandle>> =
            requests.into_iter().map(|request| self.start(request)).collect();
        join_all(handles.into_iter().map(|handle| async move { handle?.wait().await })).await
    }

    /// Request cancellation. Returns false when the rollout is not running
    /// under this kernel.
    pub fn cancel(&self, rollout_id: &RolloutId) -> bool {
        match self.running.lock().get(rollout_id) {
            Some(cancel) => {
                info!(%rollout_id, "cancel requested");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn confirm(&self, rollout_id: &RolloutId, action_id: EventId) -> Result<Event> {
        self.respond(rollout_id, action_id, ConfirmationDecision::Confirmed, None)
            .await
    }

    pub async fn reject(
        &self,
        rollout_id: &RolloutId,
        action_id: EventId,
        reason: Option<String>,
    ) -> Result<Event> {
        self.respond(rollout_id, action_id, ConfirmationDecision::Rejected, reason)
            .await
    }

    #[instrument(skip(self, reason), fields(rollout_id = %rollout_id))]
    async fn respond(
        &self,
        rollout_id: &RolloutId,
        action_id: EventId,
        decision: ConfirmationDecision,
        reason: Option<String>,
    ) -> Result<Event> {
        let state = self.state(rollout_id).await?;
        let awaiting = state.status == RolloutStatus::AwaitingConfirmation
            && state.pending.as_ref().is_some_and(|pending| pending.id == action_id);
        if !awaiting {
            bail!("rollout {rollout_id} has no action {action_id} awaiting confirmation");
        }
        self.engine
            .log()
            .append(EventDraft::action(
                rollout_id.clone(),
                EventSource::User,
                Action::ConfirmationResponse {
                    target: action_id,
                    decision,
                    reason,
                },
            ))
            .await
    }

    /// State rebuilt from the stored log.
    pub async fn state(&self, rollout_id: &RolloutId) -> Result<RolloutState> {
        let events = self.engine.log().read_all(rollout_id).await?;
        Ok(RolloutState::replay(rollout_id.clone(), &events))
    }

    /// The agent-visible view as of `as_of` (inclusive), or of the whole log.
    pub async fn get_view(&self, rollout_id: &RolloutId, as_of: Option<EventId>) -> Result<View> {
        let events = self.engine.log().read_all(rollout_id).await?;
        Ok(match as_of {
            Some(as_of) => View::as_of(&events, as_of),
            None => View::from_events(&events),
        })
    }

    pub async fn read_events(
        &self,
        rollout_id: &RolloutId,
        from_id: EventId,
        to_id: Option<EventId>,
    ) -> Result<Vec<Event>> {
        self.engine
            .log()
            .read_range(rollout_id, from_id, to_id.unwrap_or(EventId::MAX))
            .await
    }

    pub async fn subscribe(&self, rollout_id: &RolloutId, from_id: EventId) -> Result<Subscription> {
        self.engine.log().subscribe(rollout_id, from_id).await
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.engine.log().subscribe_all()
    }

    pub async fn rollouts(&self) -> Result<Vec<RolloutId>> {
        self.engine.log().rollouts().await
    }

    /// Rollouts still in flight under this kernel. Finished roots and
    /// their children are pruned once archived.
    pub fn delegation_tree(&self) -> BTreeMap<RolloutId, DelegationNode> {
        self.engine.delegates().tree().snapshot()
    }

    pub async fn trajectories(&self, query: &TrajectoryQuery) -> Result<Vec<Trajectory>> {
        let store = self
            .trajectories
            .as_ref()
            .context("trajectory archiving is disabled")?;
        Ok(store.list(query).await?)
    }

    pub async fn trajectory(&self, trajectory_id: &TrajectoryId) -> Result<Trajectory> {
        let store = self
            .trajectories
            .as_ref()
            .context("trajectory archiving is disabled")?;
        Ok(store.get(trajectory_id).await?)
    }
}
