//! Summaries for forgotten view ranges.

use tiller_protocol::{Event, EventPayload, Observation};

use crate::CondenserError;

/// Turns a forgotten range into text. Runs synchronously inside the
/// controller loop, so implementations must not block on I/O.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, events: &[Event]) -> Result<String, CondenserError>;
}

/// Deterministic digest: one truncated line per forgotten event.
#[derive(Debug, Clone)]
pub struct DigestSummarizer {
    pub max_line_chars: usize,
    pub max_lines: usize,
}

impl Default for DigestSummarizer {
    fn default() -> Self {
        Self {
            max_line_chars: 200,
            max_lines: 40,
        }
    }
}

impl Summarizer for DigestSummarizer {
    fn summarize(&self, events: &[Event]) -> Result<String, CondenserError> {
        let mut parts = vec![format!("Summary of {} earlier events:", events.len())];

        for event in events.iter().take(self.max_lines) {
            let text = match &event.payload {
                EventPayload::Action(action) => truncate(&action.render(), self.max_line_chars),
                // Earlier summaries get a wider budget than single events.
                EventPayload::Observation(observation @ Observation::Condensed { .. }) => {
                    truncate(&observation.render(), self.max_line_chars * 4)
                }
                EventPayload::Observation(observation) => {
                    truncate(&observation.render(), self.max_line_chars)
                }
                EventPayload::Condensation(_) => continue,
            };
            parts.push(format!("- #{} {}: {}", event.id, event.kind_name(), text));
        }

        if events.len() > self.max_lines {
            parts.push(format!("... and {} more", events.len() - self.max_lines));
        }
        Ok(parts.join("\n"))
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
