//! Identifier types.
//!
//! Rollout and trajectory ids are opaque string wrappers (serde-transparent,
//! UUID v4 by default). Event ids are plain per-rollout sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// True when `segment` can name a file or directory on its own: non-empty,
/// no leading dot, only ASCII alphanumerics and `-_.`. Event logs and
/// trajectory archives are laid out by rollout id, trajectory id and label,
/// so all three go through this check before touching the filesystem.
pub fn is_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Opaque string id. Fresh ids are UUID v4 so they are always path-safe;
/// ids supplied by callers (resumed rollouts, imported trajectories) are
/// taken as-is and checked by the stores.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a caller-chosen id, e.g. to resume a rollout by name.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// See [`is_path_segment`].
            pub fn is_path_safe(&self) -> bool {
                is_path_segment(&self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identifies one rollout (a Controller execution of a task), including
    /// delegated children. Names the rollout's event log file.
    RolloutId
);
string_id!(
    /// Identifies an archived trajectory. Names its JSON file.
    TrajectoryId
);

/// Position of an event within its rollout's log. Starts at 0, strictly
/// increasing, never reused.
pub type EventId = u64;
