use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tiller_protocol::{Event, EventId, RolloutId};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

/// Durable backing store for rollout logs.
///
/// Ids are assigned by [`EventLog`](crate::EventLog); a store only has to make
/// each `persist` all-or-nothing and durable before it returns.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn persist(&self, event: &Event) -> Result<()>;
    /// Events with `start <= id < end`, in id order.
    async fn read_range(&self, rollout_id: &RolloutId, start: EventId, end: EventId)
    -> Result<Vec<Event>>;
    async fn latest_id(&self, rollout_id: &RolloutId) -> Result<Option<EventId>>;
    async fn rollouts(&self) -> Result<Vec<RolloutId>>;
    /// Forget per-rollout bookkeeping once the rollout has ended. Stored
    /// events are untouched.
    fn release(&self, _rollout_id: &RolloutId) {}
}

/// One JSONL file per rollout under `<root>/events/`.
#[derive(Debug)]
pub struct FileEventStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<RolloutId, Arc<tokio::sync::Mutex<()>>>>,
    latest_cache: Mutex<HashMap<RolloutId, EventId>>,
    repaired: Mutex<HashSet<RolloutId>>,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            latest_cache: Mutex::new(HashMap::new()),
            repaired: Mutex::new(HashSet::new()),
        }
    }

    fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    fn file_path(&self, rollout_id: &RolloutId) -> Result<PathBuf> {
        if !rollout_id.is_path_safe() {
            bail!("rollout id {:?} cannot be used as a file name", rollout_id.as_str());
        }
        Ok(self.events_dir().join(format!("{rollout_id}.jsonl")))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create events dir {parent:?}"))?;
        }
        Ok(())
    }

    fn lock_for(&self, rollout_id: &RolloutId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(rollout_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Cut a torn final line so the next append starts on a fresh line.
    async fn repair_tail(path: &Path) -> Result<()> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("failed reading event log {path:?}"))?;
        if bytes.is_empty() || bytes.ends_with(b"\n") {
            return Ok(());
        }
        let keep = bytes
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |pos| pos + 1);
        warn!(?path, dropped = bytes.len() - keep, "truncating torn event line");
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(keep as u64).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Parse every complete line. A torn final line left by a crash
    /// mid-write is skipped; a corrupt line anywhere else is an error.
    async fn load(path: &Path) -> Result<Vec<Event>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }

        let last = lines.len().saturating_sub(1);
        let mut out = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => out.push(event),
                Err(error) if index == last => {
                    warn!(%error, ?path, "ignoring torn trailing event line");
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("failed parsing event line in {path:?}"));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    #[instrument(
        skip(self, event),
        fields(rollout_id = %event.rollout_id, event_id = event.id)
    )]
    async fn persist(&self, event: &Event) -> Result<()> {
        let path = self.file_path(&event.rollout_id)?;
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(&event.rollout_id);
        let _guard = lock.lock().await;

        if !self.repaired.lock().contains(&event.rollout_id) {
            Self::repair_tail(&path).await?;
            self.repaired.lock().insert(event.rollout_id.clone());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening event log {path:?}"))?;
        let original_len = file.metadata().await?.len();

        let mut line = serde_json::to_vec(event).context("failed serializing event")?;
        line.push(b'\n');
        let written = async {
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(error) = written {
            warn!(%error, "event write failed, truncating back");
            if let Err(truncate_error) = file.set_len(original_len).await {
                warn!(%truncate_error, "failed truncating event log after write error");
            }
            return Err(error).with_context(|| format!("failed writing event to {path:?}"));
        }

        self.latest_cache
            .lock()
            .insert(event.rollout_id.clone(), event.id);
        debug!("event persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(rollout_id = %rollout_id))]
    async fn read_range(
        &self,
        rollout_id: &RolloutId,
        start: EventId,
        end: EventId,
    ) -> Result<Vec<Event>> {
        let path = self.file_path(rollout_id)?;
        let events: Vec<Event> = Self::load(&path)
            .await?
            .into_iter()
            .filter(|event| (start..end).contains(&event.id))
            .collect();
        debug!(count = events.len(), "events loaded from store");
        Ok(events)
    }

    async fn latest_id(&self, rollout_id: &RolloutId) -> Result<Option<EventId>> {
        if let Some(latest) = self.latest_cache.lock().get(rollout_id).copied() {
            return Ok(Some(latest));
        }
        let path = self.file_path(rollout_id)?;
        let latest = Self::load(&path).await?.last().map(|event| event.id);
        if let Some(latest) = latest {
            self.latest_cache.lock().insert(rollout_id.clone(), latest);
        }
        Ok(latest)
    }

    async fn rollouts(&self) -> Result<Vec<RolloutId>> {
        let dir = self.events_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed listing {dir:?}"))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl")
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
            {
                out.push(RolloutId::from_string(stem));
            }
        }
        out.sort();
        Ok(out)
    }

    fn release(&self, rollout_id: &RolloutId) {
        self.write_locks.lock().remove(rollout_id);
        self.latest_cache.lock().remove(rollout_id);
        self.repaired.lock().remove(rollout_id);
    }
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    logs: Mutex<HashMap<RolloutId, Vec<Event>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn persist(&self, event: &Event) -> Result<()> {
        self.logs
            .lock()
            .entry(event.rollout_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn read_range(
        &self,
        rollout_id: &RolloutId,
        start: EventId,
        end: EventId,
    ) -> Result<Vec<Event>> {
        Ok(self
            .logs
            .lock()
            .get(rollout_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| (start..end).contains(&event.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_id(&self, rollout_id: &RolloutId) -> Result<Option<EventId>> {
        Ok(self
            .logs
            .lock()
            .get(rollout_id)
            .and_then(|events| events.last())
            .map(|event| event.id))
    }

    async fn rollouts(&self) -> Result<Vec<RolloutId>> {
        let mut out: Vec<RolloutId> = self.logs.lock().keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}
