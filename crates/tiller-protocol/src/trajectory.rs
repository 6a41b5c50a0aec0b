//! Archived rollouts and the query shape used to list them.

use crate::event::Event;
use crate::ids::{RolloutId, TrajectoryId};
use crate::state::{RolloutMetrics, RolloutStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A terminal rollout with its full event history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trajectory {
    pub trajectory_id: TrajectoryId,
    pub rollout_id: RolloutId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RolloutId>,
    /// Grouping key, e.g. the environment or benchmark name.
    pub label: String,
    pub saved_at: DateTime<Utc>,
    pub status: RolloutStatus,
    pub truncated: bool,
    pub iterations: u32,
    /// Sum of the step rewards the runtime reported.
    #[serde(default)]
    pub reward: f64,
    pub metrics: RolloutMetrics,
    #[serde(default)]
    pub metadata: Value,
    /// Hex SHA-256 of the serialized events.
    pub content_hash: String,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Filters, ordering and pagination for [`TrajectoryStore::list`](crate::ports::TrajectoryStore::list).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrajectoryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_id: Option<RolloutId>,
    /// Only delegated children of this rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RolloutId>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub offset: usize,
    pub limit: usize,
}

impl Default for TrajectoryQuery {
    fn default() -> Self {
        Self {
            label: None,
            rollout_id: None,
            parent_id: None,
            order: SortOrder::Descending,
            offset: 0,
            limit: 100,
        }
    }
}

impl TrajectoryQuery {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn children_of(parent_id: RolloutId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn accepts(&self, trajectory: &Trajectory) -> bool {
        self.label
            .as_ref()
            .is_none_or(|label| label == &trajectory.label)
            && self
                .rollout_id
                .as_ref()
                .is_none_or(|rollout| rollout == &trajectory.rollout_id)
            && self
                .parent_id
                .as_ref()
                .is_none_or(|parent| trajectory.parent_id.as_ref() == Some(parent))
    }
}
