//! Amortized view condensation.
//!
//! Condensation is lazy: nothing happens until the view exceeds its budget,
//! and then a large contiguous middle chunk is forgotten at once, shrinking
//! the view to about half of `max_size`. A log of `n` events therefore needs
//! `O(n / max_size)` condensations rather than one per step.
//!
//! The condenser only plans. The controller appends the returned
//! [`Condensation`] to the log and the view picks it up through
//! [`View::apply`](tiller_protocol::View::apply).

mod summarizer;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiller_protocol::{Condensation, CondensationStrategy, Event, View};
use tracing::{debug, warn};

pub use summarizer::{DigestSummarizer, Summarizer};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CondenserError {
    #[error("invalid condenser config: {0}")]
    InvalidConfig(String),
    #[error("summarizer failed: {0}")]
    Summarizer(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CondenserConfig {
    /// Leading events (the task framing) that are never forgotten.
    pub keep_first: usize,
    /// Condense once the view holds more events than this.
    pub max_size: usize,
    /// Optional token budget, estimated at four characters per token.
    pub max_tokens: Option<usize>,
    pub strategy: CondensationStrategy,
}

impl Default for CondenserConfig {
    fn default() -> Self {
        Self {
            keep_first: 1,
            max_size: 100,
            max_tokens: None,
            strategy: CondensationStrategy::Summary,
        }
    }
}

impl CondenserConfig {
    pub fn validate(&self) -> Result<(), CondenserError> {
        if self.max_size < self.keep_first + 2 {
            return Err(CondenserError::InvalidConfig(format!(
                "max_size ({}) must be at least keep_first + 2 ({})",
                self.max_size,
                self.keep_first + 2
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(CondenserError::InvalidConfig(
                "max_tokens must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Condenser {
    config: CondenserConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl std::fmt::Debug for Condenser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condenser")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Condenser {
    pub fn new(config: CondenserConfig) -> Result<Self, CondenserError> {
        config.validate()?;
        Ok(Self {
            config,
            summarizer: Arc::new(DigestSummarizer::default()),
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(&self) -> &CondenserConfig {
        &self.config
    }

    /// True once the view is over its size or token budget.
    pub fn should_condense(&self, view: &View) -> bool {
        view.len() > self.config.max_size
            || self
                .config
                .max_tokens
                .is_some_and(|budget| view.estimated_tokens() > budget)
    }

    /// Plan the amortized forgetting step: keep the head and roughly
    /// `max_size / 2 - keep_first - 1` of the newest events, forget the rest.
    /// `None` when there is no middle left to forget.
    pub fn get_condensation(&self, view: &View) -> Option<Condensation> {
        let events = view.events();
        let head = self.config.keep_first.min(events.len());
        let target = self.config.max_size / 2;
        let tail = target.saturating_sub(head + 1).max(1);
        if head + tail >= events.len() {
            return None;
        }
        self.plan(&events[head..events.len() - tail])
    }

    /// [`get_condensation`](Self::get_condensation) if the view is over
    /// budget. Compliant views are left alone.
    pub fn condense(&self, view: &View) -> Option<Condensation> {
        if !self.should_condense(view) {
            return None;
        }
        let condensation = self.get_condensation(view);
        if let Some(condensation) = &condensation {
            debug!(
                view_len = view.len(),
                forgotten_start = condensation.forgotten_start,
                forgotten_end = condensation.forgotten_end,
                "condensing view"
            );
        }
        condensation
    }

    /// Forget everything except the head and the newest event. Last resort
    /// before a rollout is cut off for exceeding its context budget.
    pub fn maximal_condensation(&self, view: &View) -> Option<Condensation> {
        let events = view.events();
        let head = self.config.keep_first.min(events.len());
        if head + 1 >= events.len() {
            return None;
        }
        self.plan(&events[head..events.len() - 1])
    }

    fn plan(&self, forgotten: &[Event]) -> Option<Condensation> {
        let (first, last) = (forgotten.first()?, forgotten.last()?);
        // Re-forgetting a lone marker would change nothing.
        if forgotten.len() == 1 && View::is_condensed_marker(first) {
            return None;
        }

        let summary = match self.config.strategy {
            CondensationStrategy::Elide => None,
            CondensationStrategy::Summary => match self.summarizer.summarize(forgotten) {
                Ok(summary) => Some(summary),
                Err(error) => {
                    warn!(%error, "summarizer failed, eliding instead");
                    None
                }
            },
        };
        let strategy = if summary.is_some() {
            CondensationStrategy::Summary
        } else {
            CondensationStrategy::Elide
        };

        Some(Condensation {
            forgotten_start: first.id,
            forgotten_end: last.id,
            forgotten_count: forgotten.len() as u64,
            summary,
            strategy,
        })
    }
}
