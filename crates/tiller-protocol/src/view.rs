//! Agent-visible projection of a rollout log.
//!
//! A [`View`] is a left fold of the log: hidden events are skipped, and each
//! condensation removes its forgotten range and puts a synthesized
//! `condensed` observation in its place. The marker takes the id of the
//! first forgotten event, so view ids stay strictly increasing and applying
//! the same log twice always yields the same view.

use crate::event::{Event, EventPayload, EventSource, Observation};
use crate::ids::EventId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct View {
    events: Vec<Event>,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a view from a log, applying events in id order.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut view = Self::new();
        for event in events {
            view.apply(event);
        }
        view
    }

    /// Derive the view as it stood once event `as_of` had been applied.
    pub fn as_of<'a>(events: impl IntoIterator<Item = &'a Event>, as_of: EventId) -> Self {
        Self::from_events(events.into_iter().take_while(|event| event.id <= as_of))
    }

    /// Fold one log event into the view.
    pub fn apply(&mut self, event: &Event) {
        if event.hidden {
            return;
        }
        let EventPayload::Condensation(condensation) = &event.payload else {
            self.events.push(event.clone());
            return;
        };

        let before = self.events.len();
        self.events
            .retain(|kept| !(condensation.forgets(kept.id) && kept.id < event.id));
        let removed = (before - self.events.len()) as u64;

        let marker = Event {
            id: condensation.forgotten_start,
            rollout_id: event.rollout_id.clone(),
            timestamp: event.timestamp,
            source: EventSource::Environment,
            cause_id: None,
            hidden: false,
            usage: None,
            payload: EventPayload::Observation(Observation::Condensed {
                summary: condensation.summary.clone(),
                forgotten: condensation.forgotten_count.max(removed),
            }),
        };
        let position = self
            .events
            .partition_point(|kept| kept.id < condensation.forgotten_start);
        self.events.insert(position, marker);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.events.iter().map(|event| event.id).collect()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.events.iter().map(Event::estimated_tokens).sum()
    }

    pub fn is_condensed_marker(event: &Event) -> bool {
        matches!(
            event.payload,
            EventPayload::Observation(Observation::Condensed { .. })
        )
    }
}

impl<'a> IntoIterator for &'a View {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
