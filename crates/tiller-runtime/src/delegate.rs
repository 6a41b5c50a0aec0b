use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tiller_protocol::{Agent, ErrorKind, Observation, RolloutId, RolloutState, RolloutStatus};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::{Engine, RolloutSpec};

/// Named agents available as delegation targets.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.agents.keys()).finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(name.into(), agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegationNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RolloutId>,
    pub depth: u32,
    pub agent: String,
    pub status: RolloutStatus,
}

/// Every rollout the engine has launched, keyed by id with explicit parent
/// references. Roots have depth 0 and no parent.
#[derive(Debug, Clone, Default)]
pub struct DelegationTree {
    nodes: Arc<Mutex<BTreeMap<RolloutId, DelegationNode>>>,
}

impl DelegationTree {
    pub fn insert(&self, rollout_id: RolloutId, node: DelegationNode) {
        self.nodes.lock().insert(rollout_id, node);
    }

    pub fn set_status(&self, rollout_id: &RolloutId, status: RolloutStatus) {
        if let Some(node) = self.nodes.lock().get_mut(rollout_id) {
            node.status = status;
        }
    }

    pub fn get(&self, rollout_id: &RolloutId) -> Option<DelegationNode> {
        self.nodes.lock().get(rollout_id).cloned()
    }

    pub fn children(&self, rollout_id: &RolloutId) -> Vec<RolloutId> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, node)| node.parent.as_ref() == Some(rollout_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Serializable copy of the whole tree.
    pub fn snapshot(&self) -> BTreeMap<RolloutId, DelegationNode> {
        self.nodes.lock().clone()
    }

    /// Detach `root` and all of its descendants, parents before children.
    /// Used once a root rollout has ended, so the tree only holds live work.
    pub fn remove_subtree(&self, root: &RolloutId) -> Vec<(RolloutId, DelegationNode)> {
        let mut nodes = self.nodes.lock();
        let mut removed = Vec::new();
        let mut frontier = vec![root.clone()];
        while let Some(id) = frontier.pop() {
            let Some(node) = nodes.remove(&id) else {
                continue;
            };
            frontier.extend(
                nodes
                    .iter()
                    .filter(|(_, child)| child.parent.as_ref() == Some(&id))
                    .map(|(child_id, _)| child_id.clone()),
            );
            removed.push((id, node));
        }
        removed
    }
}

/// Spawns child rollouts for `delegate` actions and folds each child's
/// terminal state into one observation for the parent.
#[derive(Debug, Clone)]
pub struct DelegateManager {
    registry: AgentRegistry,
    tree: DelegationTree,
    max_depth: u32,
}

impl DelegateManager {
    pub fn new(registry: AgentRegistry, max_depth: u32) -> Self {
        Self {
            registry,
            tree: DelegationTree::default(),
            max_depth,
        }
    }

    pub fn tree(&self) -> &DelegationTree {
        &self.tree
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Run `task` on `agent_name` as a child of `parent`. Never fails: every
    /// problem, including a panicking child, comes back as `delegate_error`.
    pub(crate) async fn delegate(
        &self,
        engine: &Arc<Engine>,
        parent: &RolloutId,
        parent_depth: u32,
        agent_name: &str,
        task: &str,
        cancel: &CancellationToken,
    ) -> Observation {
        let depth = parent_depth + 1;
        let failure = |child: Option<RolloutId>, error: ErrorKind, message: String| {
            Observation::DelegateError {
                child,
                agent: agent_name.to_owned(),
                error,
                message,
            }
        };

        if depth > self.max_depth {
            warn!(%parent, depth, max_depth = self.max_depth, "delegation depth exceeded");
            return failure(
                None,
                ErrorKind::DelegationDepthExceeded,
                format!("delegation depth {depth} exceeds maximum {}", self.max_depth),
            );
        }
        let Some(agent) = self.registry.get(agent_name) else {
            return failure(
                None,
                ErrorKind::DelegateFailed,
                format!("no agent registered as {agent_name:?}"),
            );
        };

        let child_id = RolloutId::new_uuid();
        let spec = RolloutSpec {
            rollout_id: child_id.clone(),
            agent,
            agent_name: agent_name.to_owned(),
            task: task.to_owned(),
            parent: Some(parent.clone()),
            depth,
        };
        let controller = match engine.launch(spec, cancel.child_token()).await {
            Ok(controller) => controller,
            Err(error) => {
                return failure(
                    Some(child_id),
                    ErrorKind::DelegateFailed,
                    format!("failed to start child: {error:#}"),
                );
            }
        };
        info!(%parent, child = %child_id, agent = agent_name, depth, "delegated sub-task");

        // The child honours the child token, so this join ends promptly
        // once the parent is cancelled.
        match tokio::spawn(controller.run_boxed()).await {
            Ok(Ok(state)) => fold_child(child_id, agent_name, &state),
            Ok(Err(error)) => failure(Some(child_id), ErrorKind::Internal, format!("{error:#}")),
            Err(join_error) => {
                warn!(child = %child_id, %join_error, "child rollout panicked");
                failure(
                    Some(child_id),
                    ErrorKind::Internal,
                    format!("child rollout aborted: {join_error}"),
                )
            }
        }
    }
}

fn fold_child(child: RolloutId, agent: &str, state: &RolloutState) -> Observation {
    match state.status {
        RolloutStatus::Finished => Observation::DelegateResult {
            child,
            agent: agent.to_owned(),
            outputs: state.outputs.clone().unwrap_or_default(),
            truncated: state.truncated,
        },
        RolloutStatus::Error => {
            let (error, message) = state.failure.as_ref().map_or(
                (ErrorKind::DelegateFailed, "child failed".to_owned()),
                |failure| (failure.kind, failure.message.clone()),
            );
            Observation::DelegateError {
                child: Some(child),
                agent: agent.to_owned(),
                error,
                message,
            }
        }
        status => Observation::DelegateError {
            child: Some(child),
            agent: agent.to_owned(),
            error: ErrorKind::DelegateFailed,
            message: format!("child ended as {status:?}"),
        },
    }
}
