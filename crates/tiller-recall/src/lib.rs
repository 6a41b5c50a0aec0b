//! In-band knowledge recall.
//!
//! A [`RecallCoordinator`] answers the agent's recall actions from an
//! immutable [`ProviderSet`]. Matching is a case-insensitive substring test
//! of each provider trigger against the query. Recall is synchronous and
//! never mutates a provider, so any number of rollouts can share one set.

mod provider;

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tiller_protocol::{
    EventDraft, EventId, KnowledgeFragment, Observation, RecallKind, RolloutId, WorkspaceInfo,
};
use tracing::debug;

pub use provider::{ProviderSet, StaticKnowledgeProvider, load_knowledge_dir};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecallConfig {
    /// Cap on fragments returned by one recall.
    pub max_results: usize,
    /// Directory of `*.md` knowledge files loaded at startup.
    pub knowledge_dir: Option<PathBuf>,
    pub workspace: WorkspaceInfo,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_results: 8,
            knowledge_dir: None,
            workspace: WorkspaceInfo::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecallCoordinator {
    providers: Arc<ProviderSet>,
    max_results: usize,
    workspace: WorkspaceInfo,
}

impl RecallCoordinator {
    pub fn new(providers: Arc<ProviderSet>, config: &RecallConfig) -> Self {
        Self {
            providers,
            max_results: config.max_results,
            workspace: config.workspace.clone(),
        }
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Fragments from every provider with a trigger inside `query`, in
    /// registration order, folded on (provider, content), capped at
    /// `max_results`.
    pub fn query(&self, query: &str) -> Vec<KnowledgeFragment> {
        let mut collected: IndexMap<(String, String), KnowledgeFragment> = IndexMap::new();

        'providers: for provider in self.providers.iter() {
            let Some(trigger) = provider.matches(query) else {
                continue;
            };
            let trigger = trigger.to_owned();
            for mut fragment in provider.recall(query) {
                if collected.len() >= self.max_results {
                    break 'providers;
                }
                fragment.trigger.get_or_insert_with(|| trigger.clone());
                collected
                    .entry((fragment.provider.clone(), fragment.content.clone()))
                    .or_insert(fragment);
            }
        }

        debug!(query, fragments = collected.len(), "recall matched");
        collected.into_values().collect()
    }

    /// Answer one recall request. Workspace-context recalls match against
    /// the task framing and carry the workspace metadata; knowledge recalls
    /// match against the query.
    pub fn recall(&self, kind: RecallKind, query: &str, framing: &str) -> Observation {
        match kind {
            RecallKind::WorkspaceContext => Observation::RecallResult {
                recall: kind,
                fragments: self.query(framing),
                workspace: (!self.workspace.is_empty()).then(|| self.workspace.clone()),
            },
            RecallKind::Knowledge => Observation::RecallResult {
                recall: kind,
                fragments: self.query(query),
                workspace: None,
            },
        }
    }

    /// The single observation answering recall action `action_id`.
    pub fn respond(
        &self,
        rollout_id: &RolloutId,
        action_id: EventId,
        kind: RecallKind,
        query: &str,
        framing: &str,
    ) -> EventDraft {
        EventDraft::observation(
            rollout_id.clone(),
            action_id,
            self.recall(kind, query, framing),
        )
    }
}
