//! Durable event log for tiller rollouts.
//!
//! [`EventLog`] owns id assignment and subscriber fan-out; an [`EventStore`]
//! owns durability. [`FileEventStore`] writes one JSONL file per rollout,
//! [`MemoryEventStore`] keeps everything in memory.

mod log;
mod store;

pub use log::{EventHandler, EventLog, Subscription};
pub use store::{EventStore, FileEventStore, MemoryEventStore};
