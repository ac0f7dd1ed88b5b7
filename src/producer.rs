//! Server side of the copilot stream.
//!
//! A producer task writes encoded frames into a bounded channel; the
//! response body is a [`FrameStream`] reading from the other end.

use futures::stream::Stream;
use log::{debug, info, warn};
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::context::ContextSource;
use crate::frame::{encode_frame, ContextRecord, FrameEnvelope, FrameError, ProposedAction, StreamFrame};

pub const PROMPT_PREVIEW_CHARS: usize = 200;
const TASK_TITLE_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("stream receiver went away")]
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct ProducerOptions {
    pub context_limit: usize,
    pub context_timeout: Duration,
}

impl From<&AppConfig> for ProducerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            context_limit: config.context_limit,
            context_timeout: config.context_timeout,
        }
    }
}

/// One prompt submitted to the copilot.
#[derive(Debug, Clone, Default)]
pub struct CopilotTurn {
    pub prompt: String,
    /// Anonymous callers get no context.
    pub owner: Option<String>,
    pub seq: Option<u64>,
}

/// Write half of a frame channel. Every frame is tagged with the request's
/// `seq` when it has one.
pub struct FrameSink {
    sender: mpsc::Sender<Vec<u8>>,
    seq: Option<u64>,
}

impl FrameSink {
    fn encode(&self, frame: StreamFrame) -> Result<Vec<u8>, FrameError> {
        encode_frame(&FrameEnvelope::new(frame).with_seq(self.seq))
    }

    pub async fn send(&self, frame: StreamFrame) -> Result<(), ProducerError> {
        let bytes = self.encode(frame)?;
        self.sender
            .send(bytes)
            .await
            .map_err(|_| ProducerError::Disconnected)
    }

    /// Queues a frame without waiting for room in the channel.
    pub fn try_send(&self, frame: StreamFrame) -> Result<(), ProducerError> {
        let bytes = self.encode(frame)?;
        self.sender
            .try_send(bytes)
            .map_err(|_| ProducerError::Disconnected)
    }
}

/// Response body of a copilot stream.
///
/// Once the token is cancelled the stream drains what is already buffered
/// and then ends, even if the producer is still running.
pub struct FrameStream {
    receiver: mpsc::Receiver<Vec<u8>>,
    cancel_token: CancellationToken,
}

impl Stream for FrameStream {
    type Item = Result<Vec<u8>, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel_token.is_cancelled() {
            return Poll::Ready(self.receiver.try_recv().ok().map(Ok));
        }
        self.receiver.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

pub fn frame_channel(buffer: usize, seq: Option<u64>, cancel_token: CancellationToken) -> (FrameSink, FrameStream) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (
        FrameSink { sender, seq },
        FrameStream {
            receiver,
            cancel_token,
        },
    )
}

/// Recent records for `owner`, or nothing. Failures and slow sources are
/// logged and treated as an empty context.
pub async fn fetch_context_or_empty(
    source: &dyn ContextSource,
    owner: Option<&str>,
    options: ProducerOptions,
) -> Vec<ContextRecord> {
    let Some(owner) = owner else {
        debug!("Anonymous copilot request, skipping context");
        return Vec::new();
    };

    match tokio::time::timeout(options.context_timeout, source.recent_records(owner, options.context_limit)).await {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            warn!("Context unavailable for {owner}: {e}");
            Vec::new()
        }
        Err(_) => {
            warn!("Context fetch for {owner} exceeded {:?}", options.context_timeout);
            Vec::new()
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Successive drafts for a prompt. Each one contains the previous one.
pub fn compose_drafts(prompt: &str, context: &[ContextRecord]) -> Vec<String> {
    let first = format!("Analyzing your request: {}", truncate_chars(prompt, PROMPT_PREVIEW_CHARS));

    let mut second = first.clone();
    if context.is_empty() {
        second.push_str("\n\nNo recent tasks to consider.");
    } else {
        second.push_str(&format!("\n\nConsidering {} recent task(s):", context.len()));
        for record in context {
            second.push_str(&format!("\n- {}", record.title));
            let details: Vec<&str> = [record.priority.as_deref(), record.stage.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if !details.is_empty() {
                second.push_str(&format!(" ({})", details.join(", ")));
            }
        }
    }

    vec![first, second]
}

/// Suggests capturing the prompt as a task. Nothing is suggested for a
/// blank prompt.
pub fn propose_actions(prompt: &str) -> Vec<ProposedAction> {
    let title = truncate_chars(prompt.trim(), TASK_TITLE_CHARS);
    if title.is_empty() {
        return Vec::new();
    }

    vec![ProposedAction {
        action: "createTask".to_string(),
        input: json!({ "title": title }),
    }]
}

fn emit_cancelled(sink: &FrameSink) -> Result<(), ProducerError> {
    info!("Copilot stream cancelled");
    if let Err(e) = sink.try_send(StreamFrame::error("cancelled")) {
        debug!("Cancellation frame not delivered: {e}");
    }
    Ok(())
}

/// Emits the complete frame sequence for one turn: start, context, drafts,
/// proposed actions when there are any, end.
///
/// Cancelling `cancel_token` stops the sequence with a `stream-error` frame
/// whose reason is `cancelled`.
pub async fn produce_copilot_stream(
    sink: FrameSink,
    source: Arc<dyn ContextSource>,
    turn: CopilotTurn,
    options: ProducerOptions,
    cancel_token: CancellationToken,
) -> Result<(), ProducerError> {
    sink.send(StreamFrame::start()).await?;

    let context = tokio::select! {
        _ = cancel_token.cancelled() => return emit_cancelled(&sink),
        context = fetch_context_or_empty(source.as_ref(), turn.owner.as_deref(), options) => context,
    };
    debug!("Copilot context has {} record(s)", context.len());

    let drafts = compose_drafts(&turn.prompt, &context);
    sink.send(StreamFrame::context(context)).await?;

    for draft in drafts {
        if cancel_token.is_cancelled() {
            return emit_cancelled(&sink);
        }
        sink.send(StreamFrame::draft(draft)).await?;
    }

    let actions = propose_actions(&turn.prompt);
    if !actions.is_empty() {
        sink.send(StreamFrame::proposed_actions(actions)).await?;
    }

    if cancel_token.is_cancelled() {
        return emit_cancelled(&sink);
    }
    sink.send(StreamFrame::end()).await
}
