//! # tiller-protocol — shared contract of the tiller execution engine
//!
//! Pure types and traits: no tokio, no filesystem. Every other crate in the
//! workspace depends on this one.
//!
//! ## Module Overview
//!
//! - [`ids`] — RolloutId, TrajectoryId and the per-rollout EventId
//! - [`event`] — Event, Action, Observation, Condensation, ErrorKind
//! - [`view`] — View derivation from a log
//! - [`state`] — RolloutState and its reducer
//! - [`audit`] — structural log validation
//! - [`knowledge`] — recall payloads
//! - [`ports`] — Agent, Runtime, KnowledgeProvider, TrajectoryStore
//! - [`trajectory`] — archived rollouts and list queries
//! - [`error`] — AgentError, RuntimeError, StoreError

pub mod audit;
pub mod error;
pub mod event;
pub mod ids;
pub mod knowledge;
pub mod ports;
pub mod state;
pub mod trajectory;
pub mod view;

pub use audit::{LogViolation, validate_log};
pub use error::{AgentError, RuntimeError, StoreError, StoreResult};
pub use event::{
    Action, CancelReason, Condensation, CondensationStrategy, ConfirmationDecision, ErrorKind,
    Event, EventDraft, EventPayload, EventSource, Observation, RecallKind, TokenUsage, ToolCall,
    TruncationReason,
};
pub use ids::{EventId, RolloutId, TrajectoryId, is_path_segment};
pub use knowledge::{KnowledgeFragment, WorkspaceInfo};
pub use ports::{
    Agent, AgentTurn, ExecutionReport, ExecutionRequest, KnowledgeProvider, Runtime,
    TrajectoryStore,
};
pub use state::{
    PendingAction, RolloutFailure, RolloutMetrics, RolloutState, RolloutStatus, Transition,
};
pub use trajectory::{SortOrder, Trajectory, TrajectoryQuery};
pub use view::View;
