use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tiller_kernel::KernelBuilder;
use tiller_runtime::{EchoRuntime, ScriptStep, ScriptedAgent};

/// A scripted rollout: the agent's steps, any delegate agents' steps and
/// the echo runtime's latency.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFile {
    #[serde(default = "default_agent")]
    pub agent: String,
    pub task: String,
    pub steps: Vec<ScriptStep>,
    #[serde(default)]
    pub delegates: BTreeMap<String, Vec<ScriptStep>>,
    #[serde(default)]
    pub runtime_latency_ms: u64,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_agent() -> String {
    "scripted".to_owned()
}

impl ScriptFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading script: {}", path.display()))?;
        let script: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing script: {}", path.display()))?;
        if script.delegates.contains_key(&script.agent) {
            bail!("delegate {:?} shadows the main agent", script.agent);
        }
        Ok(script)
    }

    /// Register the scripted agents and an echo runtime on `builder`.
    pub fn install(&self, builder: KernelBuilder) -> KernelBuilder {
        let mut runtime = EchoRuntime::new();
        if self.runtime_latency_ms > 0 {
            runtime = runtime.with_latency(Duration::from_millis(self.runtime_latency_ms));
        }
        let mut builder = builder.runtime(Arc::new(runtime)).agent(
            self.agent.clone(),
            Arc::new(ScriptedAgent::new(self.agent.clone(), self.steps.clone())),
        );
        for (name, steps) in &self.delegates {
            builder = builder.agent(
                name.clone(),
                Arc::new(ScriptedAgent::new(name.clone(), steps.clone())),
            );
        }
        builder
    }
}
