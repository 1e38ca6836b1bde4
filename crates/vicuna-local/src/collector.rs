//! Response collection from the unframed output stream.
//!
//! The executable never frames its replies. A response ends when a chunk
//! satisfies the session's [`ResponseTerminator`] or when the stream has been
//! quiet for the idle timeout, whichever happens first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::config::TokenCallback;
use crate::error::{Result, VicunaError};

/// Passed to the token callback once a response is complete.
pub const END_MARKER: &str = "<end>";

/// Decides where a model turn ends.
pub trait ResponseTerminator: Send + Sync {
    /// Whether `chunk` marks the end of the model's turn.
    fn is_end(&self, chunk: &str) -> bool;

    /// Whether `chunk` shows the executable is waiting for its first prompt.
    fn is_ready(&self, chunk: &str) -> bool {
        self.is_end(chunk)
    }

    /// Clean up the accumulated text before it is returned.
    fn finish(&self, response: String) -> String {
        response
    }
}

/// The interactive prompt marker `>` printed by llama.cpp when it waits for input.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptMarker;

impl ResponseTerminator for PromptMarker {
    fn is_end(&self, chunk: &str) -> bool {
        chunk.contains('>')
    }

    fn finish(&self, mut response: String) -> String {
        if response.ends_with('>') {
            response.pop();
        }
        response
    }
}

/// Output read from the child's stdout by the pump task.
#[derive(Debug)]
pub(crate) enum OutputEvent {
    Chunk(String),
    Failed(std::io::Error),
    Closed,
}

/// Whether a response is still being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Complete,
}

/// Accumulates one response.
pub struct ResponseCollector {
    terminator: Arc<dyn ResponseTerminator>,
    on_token: TokenCallback,
    response: String,
}

impl ResponseCollector {
    pub fn new(terminator: Arc<dyn ResponseTerminator>, on_token: TokenCallback) -> Self {
        Self {
            terminator,
            on_token,
            response: String::new(),
        }
    }

    /// Feed one chunk. The callback sees the chunk before the end marker.
    pub fn push(&mut self, chunk: &str) -> Progress {
        (self.on_token)(chunk);
        self.response.push_str(chunk);

        if self.terminator.is_end(chunk) {
            (self.on_token)(END_MARKER);
            Progress::Complete
        } else {
            Progress::Pending
        }
    }

    /// Text accumulated so far, before cleanup.
    pub fn text(&self) -> &str {
        &self.response
    }

    pub fn finish(self) -> String {
        self.terminator.finish(self.response)
    }
}

/// Drive `collector` from `events` until the response ends.
///
/// The idle deadline is armed by the first chunk and re-armed by every chunk
/// after it. A bump of `closed` aborts with [`VicunaError::SessionClosed`].
pub(crate) async fn collect_response(
    events: &mut mpsc::UnboundedReceiver<OutputEvent>,
    closed: &mut watch::Receiver<u64>,
    mut collector: ResponseCollector,
    idle_timeout: Duration,
) -> Result<String> {
    let mut idle_deadline: Option<Instant> = None;

    loop {
        let deadline = idle_deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            biased;

            _ = closed.changed() => {
                debug!("Session closed while collecting a response");
                return Err(VicunaError::SessionClosed);
            }

            event = events.recv() => match event {
                Some(OutputEvent::Chunk(text)) => {
                    trace!("chunk: {:?}", text);
                    idle_deadline = Some(Instant::now() + idle_timeout);
                    if collector.push(&text) == Progress::Complete {
                        debug!("Response ended at prompt marker");
                        return Ok(collector.finish());
                    }
                }
                Some(OutputEvent::Failed(e)) => return Err(VicunaError::Io(e)),
                Some(OutputEvent::Closed) | None => return Err(VicunaError::ProcessExited),
            },

            _ = sleep_until(deadline), if idle_deadline.is_some() => {
                debug!(
                    "Response ended after {:?} without output ({} bytes)",
                    idle_timeout,
                    collector.text().len()
                );
                return Ok(collector.finish());
            }
        }
    }
}
