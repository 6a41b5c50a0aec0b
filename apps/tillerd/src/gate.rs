//! Answers confirmation gates for `tillerd run`.

use anyhow::Result;
use clap::ValueEnum;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tiller_kernel::Kernel;
use tiller_protocol::{Action, Event, RolloutStatus, ToolCall};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

/// What to do with a tool call held for confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum GatePolicy {
    /// Ask on the terminal. Anything but `y`/`yes`, or end of input, rejects.
    #[default]
    Prompt,
    Confirm,
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateTally {
    pub confirmed: usize,
    pub rejected: usize,
}

/// Answer every gated call in `events` until the stream ends.
///
/// Only calls the rollout is still waiting on are answered, so replayed
/// history of a resumed rollout is skipped.
pub async fn answer_gates<R, W>(
    kernel: Kernel,
    mut events: BoxStream<'static, Event>,
    policy: GatePolicy,
    mut input: R,
    mut output: W,
) -> Result<GateTally>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tally = GateTally::default();
    while let Some(event) = events.next().await {
        let Some(Action::ToolCall(call)) = event.as_action() else {
            continue;
        };
        if !call.requires_confirmation {
            continue;
        }
        let state = kernel.state(&event.rollout_id).await?;
        let waiting = state.status == RolloutStatus::AwaitingConfirmation
            && state.pending.as_ref().is_some_and(|pending| pending.id == event.id);
        if !waiting {
            continue;
        }

        let confirmed = match policy {
            GatePolicy::Confirm => true,
            GatePolicy::Reject => false,
            GatePolicy::Prompt => ask(call, &mut input, &mut output).await?,
        };
        let answered = if confirmed {
            kernel.confirm(&event.rollout_id, event.id).await
        } else {
            kernel
                .reject(&event.rollout_id, event.id, Some("rejected by operator".to_owned()))
                .await
        };
        match answered {
            Ok(_) if confirmed => tally.confirmed += 1,
            Ok(_) => tally.rejected += 1,
            // Cancelled while we were asking.
            Err(error) => {
                warn!(action_id = event.id, error = %format!("{error:#}"), "gate answer not recorded");
                continue;
            }
        }
        info!(action_id = event.id, tool = %call.tool_name, confirmed, "gate answered");
    }
    Ok(tally)
}

async fn ask<R, W>(call: &ToolCall, input: &mut R, output: &mut W) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let prompt = format!("run {} {}? [y/N] ", call.tool_name, call.arguments);
    output.write_all(prompt.as_bytes()).await?;
    output.flush().await?;

    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Ok(false);
    }
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
