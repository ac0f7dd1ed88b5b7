use cfg_if::cfg_if;
use log::{debug, warn};

use crate::frame::{decode_frame, FrameEnvelope, FrameError, FRAME_DELIMITER};

/// Incremental splitter for a line-delimited frame stream.
///
/// Bytes are buffered until a delimiter arrives, and only complete lines are
/// decoded. The delimiter byte never occurs inside a multi-byte UTF-8
/// sequence, so a code point split across two reads is reassembled before it
/// is decoded. The frames produced therefore do not depend on how the body
/// was chunked.
///
/// Lines that are blank are ignored. Lines that are not valid frames are
/// skipped and counted; they never stop the decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every frame completed by it, in arrival
    /// order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEnvelope> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..]
            .iter()
            .position(|byte| *byte == FRAME_DELIMITER)
        {
            let end = start + offset;
            match parse_line(&self.pending[start..end]) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping malformed frame: {e}");
                }
            }
            start = end + 1;
        }
        self.pending.drain(..start);

        frames
    }

    /// Flushes the trailing line once the body has ended. The tail is only
    /// dispatched when it is a complete frame on its own.
    pub fn finish(&mut self) -> Option<FrameEnvelope> {
        let tail = std::mem::take(&mut self.pending);
        match parse_line(&tail) {
            Ok(frame) => frame,
            Err(e) => {
                self.skipped += 1;
                debug!("Discarding incomplete trailing frame ({} bytes): {e}", tail.len());
                None
            }
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn parse_line(line: &[u8]) -> Result<Option<FrameEnvelope>, FrameError> {
    let text = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    decode_frame(text).map(Some)
}

cfg_if! {
    if #[cfg(feature = "ssr")] {
        use futures::stream::{Stream, StreamExt};
        use std::fmt;
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        /// Why the driver stopped reading.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum StreamTermination {
            /// The body ended. Whether the answer is complete depends on the
            /// frames that were seen.
            Closed,
            Cancelled,
            /// No bytes arrived within the idle window.
            TimedOut,
            Transport(String),
        }

        impl fmt::Display for StreamTermination {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    StreamTermination::Closed => write!(f, "closed"),
                    StreamTermination::Cancelled => write!(f, "cancelled"),
                    StreamTermination::TimedOut => write!(f, "timeout"),
                    StreamTermination::Transport(e) => write!(f, "transport error: {e}"),
                }
            }
        }

        /// Reads `body` to completion, handing each frame to `on_frame` as
        /// soon as its line is complete.
        ///
        /// Every read is bounded by `idle_timeout`. Cancelling `cancel_token`
        /// stops the read immediately and drops the body, which releases the
        /// connection.
        pub async fn drive_stream<S, B, E, F>(
            mut body: S,
            idle_timeout: Duration,
            cancel_token: &CancellationToken,
            mut on_frame: F,
        ) -> StreamTermination
        where
            S: Stream<Item = Result<B, E>> + Unpin,
            B: AsRef<[u8]>,
            E: fmt::Display,
            F: FnMut(FrameEnvelope),
        {
            let mut decoder = FrameDecoder::new();

            loop {
                let next = tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Stream read cancelled");
                        return StreamTermination::Cancelled;
                    }
                    next = tokio::time::timeout(idle_timeout, body.next()) => next,
                };

                match next {
                    Err(_) => {
                        warn!("No frame received within {idle_timeout:?}");
                        return StreamTermination::TimedOut;
                    }
                    Ok(None) => break,
                    Ok(Some(Ok(chunk))) => {
                        for frame in decoder.push(chunk.as_ref()) {
                            on_frame(frame);
                        }
                    }
                    Ok(Some(Err(e))) => {
                        warn!("Stream transport failed: {e}");
                        return StreamTermination::Transport(e.to_string());
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                on_frame(frame);
            }
            if decoder.skipped() > 0 {
                debug!("Stream closed after skipping {} frame(s)", decoder.skipped());
            }

            StreamTermination::Closed
        }
    }
}
