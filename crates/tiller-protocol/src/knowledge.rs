//! Recall payload types: knowledge fragments and workspace metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One piece of content contributed by a knowledge provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KnowledgeFragment {
    pub provider: String,
    /// The trigger that matched, if the fragment was trigger-selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub content: String,
}

/// Repository and runtime metadata returned for workspace-context recalls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Host name to port for services reachable from the runtime.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_hosts: BTreeMap<String, u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl WorkspaceInfo {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(repository) = &self.repository {
            match &self.branch {
                Some(branch) => lines.push(format!("repository: {repository} ({branch})")),
                None => lines.push(format!("repository: {repository}")),
            }
        }
        if let Some(dir) = &self.working_dir {
            lines.push(format!("working directory: {dir}"));
        }
        for (host, port) in &self.runtime_hosts {
            lines.push(format!("host: {host}:{port}"));
        }
        if let Some(instructions) = &self.instructions {
            lines.push(instructions.clone());
        }
        lines.join("\n")
    }
}
