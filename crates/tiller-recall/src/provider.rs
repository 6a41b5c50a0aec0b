use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tiller_protocol::{KnowledgeFragment, KnowledgeProvider};
use tokio::fs;
use tracing::{debug, warn};

/// Fixed content selected by trigger phrases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticKnowledgeProvider {
    name: String,
    triggers: Vec<String>,
    content: String,
}

impl StaticKnowledgeProvider {
    pub fn new(
        name: impl Into<String>,
        triggers: impl IntoIterator<Item = impl Into<String>>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            triggers: triggers.into_iter().map(Into::into).collect(),
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

impl KnowledgeProvider for StaticKnowledgeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn triggers(&self) -> &[String] {
        &self.triggers
    }

    fn recall(&self, _query: &str) -> Vec<KnowledgeFragment> {
        vec![KnowledgeFragment {
            provider: self.name.clone(),
            trigger: None,
            content: self.content.clone(),
        }]
    }
}

/// Providers in registration order. Built once, then shared read-only.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn KnowledgeProvider>>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ProviderSet {
    /// Rejects duplicate provider names.
    pub fn new(providers: Vec<Arc<dyn KnowledgeProvider>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.name().to_owned()) {
                bail!("duplicate knowledge provider {:?}", provider.name());
            }
        }
        Ok(Self { providers })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|provider| provider.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn KnowledgeProvider>> {
        self.providers.iter()
    }
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    name: Option<String>,
    #[serde(default)]
    triggers: Vec<String>,
}

const FENCE: &str = "+++";

/// Split a `+++`-fenced TOML header from the markdown body.
fn parse_knowledge_file(stem: &str, raw: &str) -> Result<Option<StaticKnowledgeProvider>> {
    let Some(rest) = raw.trim_start().strip_prefix(FENCE) else {
        return Ok(None);
    };
    let Some((header, body)) = rest.split_once(&format!("\n{FENCE}")) else {
        bail!("unterminated front matter");
    };
    let front: FrontMatter = toml::from_str(header).context("invalid front matter")?;
    if front.triggers.is_empty() {
        return Ok(None);
    }
    Ok(Some(StaticKnowledgeProvider {
        name: front.name.unwrap_or_else(|| stem.to_owned()),
        triggers: front.triggers,
        content: body.trim().to_owned(),
    }))
}

/// Load every `*.md` file of `dir` that declares triggers, sorted by file
/// name so registration order is stable across runs.
pub async fn load_knowledge_dir(dir: &Path) -> Result<Vec<StaticKnowledgeProvider>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed reading knowledge dir {dir:?}"))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "md") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut providers = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed reading knowledge file {path:?}"))?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("knowledge");
        match parse_knowledge_file(stem, &raw).with_context(|| format!("in {path:?}"))? {
            Some(provider) => providers.push(provider),
            None => warn!(?path, "knowledge file declares no triggers, skipping"),
        }
    }
    debug!(count = providers.len(), ?dir, "knowledge providers loaded");
    Ok(providers)
}
