use serde::{Deserialize, Serialize};
use tiller_protocol::ToolCall;

/// Tool-name patterns whose calls wait for a user confirmation before they
/// reach the runtime. A trailing `*` matches any suffix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfirmationPolicy {
    pub gate: Vec<String>,
}

impl ConfirmationPolicy {
    pub fn gating(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            gate: patterns.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(pattern: &str, actual: &str) -> bool {
        if pattern.ends_with('*') {
            let prefix = pattern.trim_end_matches('*');
            prefix.is_empty() || actual.starts_with(prefix)
        } else {
            pattern == actual
        }
    }

    pub fn requires_confirmation(&self, call: &ToolCall) -> bool {
        call.requires_confirmation
            || self
                .gate
                .iter()
                .any(|pattern| Self::matches(pattern, &call.tool_name))
    }

    /// Mark the call if the policy gates it.
    pub fn apply(&self, mut call: ToolCall) -> ToolCall {
        call.requires_confirmation = self.requires_confirmation(&call);
        call
    }
}
