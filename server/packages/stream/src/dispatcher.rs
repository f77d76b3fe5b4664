use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::registry::{Emission, SessionRegistry, ThrottleGate};
use crate::sink::MessageSink;

/// Shown when a conversation completes without any visible text.
pub const COMPLETION_FALLBACK: &str = "Completed";
pub const TRUNCATION_MARKER: &str = "\n\n... (truncated)";

/// Joins the response text and the status line into what the user sees.
pub fn compose_display(text: &str, status: &str) -> String {
    match (text.is_empty(), status.is_empty()) {
        (_, true) => text.to_string(),
        (true, false) => status.to_string(),
        (false, false) => format!("{text}\n\n{status}"),
    }
}

/// Cuts `display` to `max_chars` characters and appends the marker.
pub fn truncate_display(display: String, max_chars: usize) -> String {
    match display.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut truncated = display;
            truncated.truncate(cut);
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => display,
    }
}

pub(crate) struct Dispatcher {
    sink: Arc<dyn MessageSink>,
    throttle: Duration,
    max_chars: usize,
}

impl Dispatcher {
    pub(crate) fn new(sink: Arc<dyn MessageSink>, throttle: Duration, max_chars: usize) -> Self {
        Self {
            sink,
            throttle,
            max_chars,
        }
    }

    /// Emits the current display unless the session was emitted to within
    /// the throttle window. Skipped updates are dropped, not queued.
    pub(crate) async fn emit_throttled(&self, registry: &SessionRegistry, session_id: &str) {
        let gate = ThrottleGate {
            window: self.throttle,
            now: Instant::now(),
        };
        let max_chars = self.max_chars;
        let emission = registry
            .capture(session_id, Some(gate), |state| {
                let display = compose_display(state.text(), state.status());
                if display.is_empty() {
                    return None;
                }
                Some(truncate_display(display, max_chars))
            })
            .await;
        if let Some(emission) = emission {
            self.deliver(registry, &emission).await;
        }
    }

    /// Emits the final text regardless of the throttle window and removes
    /// the session. Returns false when the session was not registered.
    pub(crate) async fn emit_final(&self, registry: &SessionRegistry, session_id: &str) -> bool {
        let max_chars = self.max_chars;
        let emission = registry
            .capture(session_id, None, |state| {
                let text = if state.text().is_empty() {
                    COMPLETION_FALLBACK.to_string()
                } else {
                    state.text().to_string()
                };
                Some(truncate_display(text, max_chars))
            })
            .await;
        let Some(emission) = emission else {
            return false;
        };
        self.deliver(registry, &emission).await;
        registry.finish(&emission).await
    }

    async fn deliver(&self, registry: &SessionRegistry, emission: &Emission) {
        let destination = emission.destination;
        let text = emission.text.clone();
        let result = match emission.message {
            Some(handle) => self
                .sink
                .update(destination, handle, text)
                .await
                .map(|()| handle),
            None => self.sink.create(destination, text).await,
        };
        let handle = match result {
            Ok(handle) => Some(handle),
            Err(err) if err.is_not_modified() => {
                tracing::debug!(
                    session_id = %emission.session_id,
                    chat_id = destination.chat_id,
                    "message unchanged"
                );
                emission.message
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %emission.session_id,
                    chat_id = destination.chat_id,
                    error = %err,
                    "failed to deliver message"
                );
                return;
            }
        };
        registry
            .record_emission(emission, handle, Instant::now())
            .await;
    }
}
