use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tiller_protocol::{Event, EventDraft, EventId, RolloutId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument, warn};

use crate::store::EventStore;

/// Per-rollout writer state. Guarded by the rollout's own async lock, so
/// appends to different rollouts never contend.
#[derive(Default)]
struct RolloutSlot {
    next_id: Option<EventId>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    /// Set once the rollout ended and the slot left the map. Waiters that
    /// still hold it must look up a fresh one.
    closed: bool,
}

/// Append-only, ordered, durable record of every rollout.
///
/// Each rollout has a single-writer critical section in which the id is
/// assigned, the event is persisted and then handed to every subscriber
/// queue. Queues are unbounded, so a slow reader never blocks the writer or
/// other readers.
///
/// A terminal event closes every queue of its rollout and drops the
/// rollout's slot, so finished rollouts hold no memory here.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    slots: Arc<Mutex<HashMap<RolloutId, Arc<tokio::sync::Mutex<RolloutSlot>>>>>,
    global: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            slots: Arc::new(Mutex::new(HashMap::new())),
            global: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn slot_for(&self, rollout_id: &RolloutId) -> Arc<tokio::sync::Mutex<RolloutSlot>> {
        self.slots
            .lock()
            .entry(rollout_id.clone())
            .or_default()
            .clone()
    }

    /// Drop the rollout's queues and evict its slot. Called with the slot
    /// locked.
    fn close(
        &self,
        rollout_id: &RolloutId,
        handle: &Arc<tokio::sync::Mutex<RolloutSlot>>,
        slot: &mut RolloutSlot,
    ) {
        slot.closed = true;
        slot.subscribers.clear();
        {
            let mut slots = self.slots.lock();
            if slots
                .get(rollout_id)
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                slots.remove(rollout_id);
            }
        }
        self.store.release(rollout_id);
        debug!("rollout slot closed");
    }

    /// Assign the next id, persist durably and fan out. On failure nothing is
    /// stored and the id is not consumed.
    #[instrument(skip(self, draft), fields(rollout_id = %draft.rollout_id))]
    pub async fn append(&self, draft: EventDraft) -> Result<Event> {
        loop {
            let handle = self.slot_for(&draft.rollout_id);
            let mut slot = handle.lock().await;
            if slot.closed {
                continue;
            }

            let id = match slot.next_id {
                Some(next) => next,
                None => self
                    .store
                    .latest_id(&draft.rollout_id)
                    .await
                    .context("failed resolving latest event id")?
                    .map_or(0, |latest| latest + 1),
            };

            let event = draft.into_event(id, Utc::now());
            self.store.persist(&event).await?;
            slot.next_id = Some(id + 1);

            slot.subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
            self.global
                .lock()
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());

            debug!(event_id = id, kind = event.kind_name(), "event appended");
            if event.is_terminal() {
                self.close(&event.rollout_id, &handle, &mut slot);
            }
            return Ok(event);
        }
    }

    /// Replay stored events with `id >= from_id`, then stream live ones.
    /// The queue of a rollout that already ended closes after the replay.
    ///
    /// History is read under the rollout's lock, so the hand-over to live
    /// delivery has no gap and no duplicate.
    #[instrument(skip(self), fields(rollout_id = %rollout_id))]
    pub async fn subscribe(&self, rollout_id: &RolloutId, from_id: EventId) -> Result<Subscription> {
        loop {
            let handle = self.slot_for(rollout_id);
            let mut slot = handle.lock().await;
            if slot.closed {
                continue;
            }

            let history = self.store.read_range(rollout_id, 0, EventId::MAX).await?;
            let ended = history.iter().any(Event::is_terminal);
            let (sender, receiver) = mpsc::unbounded_channel();
            for event in history.into_iter().filter(|event| event.id >= from_id) {
                // The receiver is still held here.
                let _ = sender.send(event);
            }
            if ended {
                self.close(rollout_id, &handle, &mut slot);
            } else {
                slot.subscribers.push(sender);
            }

            return Ok(Subscription {
                rollout_id: Some(rollout_id.clone()),
                receiver,
            });
        }
    }

    /// Live events of every rollout. Per-rollout order is preserved.
    pub fn subscribe_all(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.global.lock().push(sender);
        Subscription {
            rollout_id: None,
            receiver,
        }
    }

    /// Drive `handler` from its own task until the log drops the queue or
    /// the handler fails.
    pub async fn subscribe_with(
        &self,
        rollout_id: &RolloutId,
        from_id: EventId,
        handler: Arc<dyn EventHandler>,
    ) -> Result<JoinHandle<()>> {
        let mut subscription = self.subscribe(rollout_id, from_id).await?;
        Ok(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(error) = handler.handle(&event).await {
                    warn!(%error, event_id = event.id, "event handler failed, unsubscribing");
                    break;
                }
            }
        }))
    }

    /// Events with `start <= id < end`.
    pub async fn read_range(
        &self,
        rollout_id: &RolloutId,
        start: EventId,
        end: EventId,
    ) -> Result<Vec<Event>> {
        self.store.read_range(rollout_id, start, end).await
    }

    pub async fn read_all(&self, rollout_id: &RolloutId) -> Result<Vec<Event>> {
        self.read_range(rollout_id, 0, EventId::MAX).await
    }

    pub async fn latest_id(&self, rollout_id: &RolloutId) -> Result<Option<EventId>> {
        self.store.latest_id(rollout_id).await
    }

    pub async fn rollouts(&self) -> Result<Vec<RolloutId>> {
        self.store.rollouts().await
    }
}

/// Consumer driven by [`EventLog::subscribe_with`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Receiving end of one subscriber queue.
#[derive(Debug)]
pub struct Subscription {
    rollout_id: Option<RolloutId>,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// `None` for [`EventLog::subscribe_all`] subscriptions.
    pub fn rollout_id(&self) -> Option<&RolloutId> {
        self.rollout_id.as_ref()
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Event> {
        UnboundedReceiverStream::new(self.receiver)
    }

    /// Stream that ends after the rollout's terminal event.
    pub fn until_terminal(mut self) -> BoxStream<'static, Event> {
        Box::pin(async_stream::stream! {
            while let Some(event) = self.receiver.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        })
    }
}
