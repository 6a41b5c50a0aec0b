use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tiller_protocol::{
    Event, RolloutId, RolloutState, SortOrder, StoreError, StoreResult, Trajectory, TrajectoryId,
    TrajectoryQuery, TrajectoryStore, is_path_segment,
};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Hex SHA-256 of the serialized events.
pub fn content_hash(events: &[Event]) -> StoreResult<String> {
    let payload = serde_json::to_vec(events)?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

/// Package a terminal rollout for archiving.
pub fn build_trajectory(
    state: &RolloutState,
    events: Vec<Event>,
    label: impl Into<String>,
    parent_id: Option<RolloutId>,
    metadata: Value,
) -> StoreResult<Trajectory> {
    Ok(Trajectory {
        trajectory_id: TrajectoryId::new_uuid(),
        rollout_id: state.rollout_id.clone(),
        parent_id,
        label: label.into(),
        saved_at: Utc::now(),
        status: state.status,
        truncated: state.truncated,
        iterations: state.iteration,
        reward: state.reward,
        metrics: state.metrics.clone(),
        metadata,
        content_hash: content_hash(&events)?,
        events,
    })
}

/// One pretty-printed JSON file per trajectory at `<root>/<label>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileTrajectoryStore {
    root: PathBuf,
}

impl FileTrajectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checked(segment: &str, what: &str) -> StoreResult<()> {
        if is_path_segment(segment) {
            Ok(())
        } else {
            Err(StoreError::Io(format!("{what} {segment:?} is not a valid path segment")))
        }
    }

    async fn label_dirs(&self) -> StoreResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn read(path: &Path) -> StoreResult<Trajectory> {
        let raw = fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl TrajectoryStore for FileTrajectoryStore {
    #[instrument(skip(self, trajectory), fields(trajectory_id = %trajectory.trajectory_id, label = %trajectory.label))]
    async fn save(&self, trajectory: &Trajectory) -> StoreResult<TrajectoryId> {
        Self::checked(&trajectory.label, "label")?;
        Self::checked(trajectory.trajectory_id.as_str(), "trajectory id")?;

        let dir = self.root.join(&trajectory.label);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", trajectory.trajectory_id));
        let staging = dir.join(format!(".{}.json.tmp", trajectory.trajectory_id));
        fs::write(&staging, serde_json::to_vec_pretty(trajectory)?).await?;
        fs::rename(&staging, &path).await?;

        debug!(events = trajectory.events.len(), "trajectory saved");
        Ok(trajectory.trajectory_id.clone())
    }

    async fn get(&self, trajectory_id: &TrajectoryId) -> StoreResult<Trajectory> {
        Self::checked(trajectory_id.as_str(), "trajectory id")?;
        for dir in self.label_dirs().await? {
            let path = dir.join(format!("{trajectory_id}.json"));
            if fs::try_exists(&path).await? {
                return Self::read(&path).await;
            }
        }
        Err(StoreError::NotFound(format!("trajectory {trajectory_id}")))
    }

    #[instrument(skip(self))]
    async fn list(&self, query: &TrajectoryQuery) -> StoreResult<Vec<Trajectory>> {
        let dirs = match &query.label {
            Some(label) => {
                Self::checked(label, "label")?;
                vec![self.root.join(label)]
            }
            None => self.label_dirs().await?,
        };

        let mut found = Vec::new();
        for dir in dirs {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_json = path.extension().is_some_and(|ext| ext == "json");
                let staged = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
                if !is_json || staged {
                    continue;
                }
                match Self::read(&path).await {
                    Ok(trajectory) if query.accepts(&trajectory) => found.push(trajectory),
                    Ok(_) => {}
                    Err(error) => {
                        warn!(path = %path.display(), %error, "skipping unreadable trajectory");
                    }
                }
            }
        }

        found.sort_by(|a, b| {
            a.saved_at
                .cmp(&b.saved_at)
                .then_with(|| a.trajectory_id.cmp(&b.trajectory_id))
        });
        if query.order == SortOrder::Descending {
            found.reverse();
        }
        Ok(found
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}
