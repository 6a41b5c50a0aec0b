//! Structural checks over a stored rollout log.

use crate::event::{Event, EventPayload};
use crate::ids::{EventId, RolloutId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogViolation {
    #[error("event {id} belongs to rollout {found}, expected {expected}")]
    ForeignEvent {
        id: EventId,
        expected: RolloutId,
        found: RolloutId,
    },
    #[error("event id {id} does not follow {previous}")]
    NonIncreasingId { id: EventId, previous: EventId },
    #[error("observation {id} has no cause")]
    MissingCause { id: EventId },
    #[error("observation {id} cites {cause_id}, which is not an earlier action")]
    InvalidCause { id: EventId, cause_id: EventId },
    #[error("action {cause_id} fulfilled twice (by {first} and {second})")]
    DoubleFulfilment {
        cause_id: EventId,
        first: EventId,
        second: EventId,
    },
    #[error("condensation {id} forgets range {start}..={end} reaching itself")]
    CondensationAhead {
        id: EventId,
        start: EventId,
        end: EventId,
    },
}

/// Check that ids strictly increase, every observation cites an earlier
/// action of the same rollout, no action is fulfilled twice and every
/// condensation only forgets older events.
pub fn validate_log(rollout_id: &RolloutId, events: &[Event]) -> Result<(), LogViolation> {
    let mut previous: Option<EventId> = None;
    let mut actions = BTreeSet::new();
    let mut fulfilled: BTreeMap<EventId, EventId> = BTreeMap::new();

    for event in events {
        if &event.rollout_id != rollout_id {
            return Err(LogViolation::ForeignEvent {
                id: event.id,
                expected: rollout_id.clone(),
                found: event.rollout_id.clone(),
            });
        }
        if let Some(previous) = previous
            && event.id <= previous
        {
            return Err(LogViolation::NonIncreasingId {
                id: event.id,
                previous,
            });
        }
        previous = Some(event.id);

        match &event.payload {
            EventPayload::Action(_) => {
                actions.insert(event.id);
            }
            EventPayload::Observation(observation) => {
                let cause_id = event
                    .cause_id
                    .ok_or(LogViolation::MissingCause { id: event.id })?;
                if !actions.contains(&cause_id) {
                    return Err(LogViolation::InvalidCause {
                        id: event.id,
                        cause_id,
                    });
                }
                if observation.fulfills_cause()
                    && let Some(first) = fulfilled.insert(cause_id, event.id)
                {
                    return Err(LogViolation::DoubleFulfilment {
                        cause_id,
                        first,
                        second: event.id,
                    });
                }
            }
            EventPayload::Condensation(condensation) => {
                if condensation.forgotten_end >= event.id
                    || condensation.forgotten_start > condensation.forgotten_end
                {
                    return Err(LogViolation::CondensationAhead {
                        id: event.id,
                        start: condensation.forgotten_start,
                        end: condensation.forgotten_end,
                    });
                }
            }
        }
    }
    Ok(())
}
