use std::sync::Arc;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_event, RelayEvent, SseDecoder};
use crate::dispatcher::Dispatcher;
use crate::registry::SessionRegistry;
use crate::sink::{Destination, MessageHandle, MessageSink};
use crate::RelayConfig;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event stream cancelled")]
    Cancelled,
    #[error("failed to connect to event stream: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("event stream returned status {0}")]
    Status(u16),
    #[error("failed to read event stream: {0}")]
    Read(#[source] reqwest::Error),
    #[error("event stream closed by server")]
    Closed,
}

impl StreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Keeps the OpenCode event feed open and relays assembled responses to
/// registered destinations.
pub struct StreamRelay {
    config: RelayConfig,
    http_client: Client,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    connected: watch::Sender<bool>,
}

impl StreamRelay {
    pub fn new(config: RelayConfig, sink: Arc<dyn MessageSink>) -> Self {
        let dispatcher = Dispatcher::new(sink, config.edit_throttle, config.max_display_chars);
        let (connected, _rx) = watch::channel(false);
        Self {
            config,
            http_client: Client::new(),
            registry: Arc::new(SessionRegistry::new()),
            dispatcher,
            connected,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn register(
        &self,
        session_id: &str,
        destination: Destination,
        message: Option<MessageHandle>,
    ) {
        self.registry.register(session_id, destination, message).await;
    }

    pub async fn unregister(&self, session_id: &str) -> bool {
        self.registry.unregister(session_id).await
    }

    pub async fn active_count(&self) -> usize {
        self.registry.active_count().await
    }

    /// Watch channel that is `true` while the event stream is connected.
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Reads the event stream until `cancel` fires, reconnecting after a
    /// fixed delay whenever the connection fails or ends.
    ///
    /// Always resolves to [`StreamError::Cancelled`]. A pending read or a
    /// sink call still in flight is abandoned as soon as the token is
    /// cancelled, which drops the underlying request.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StreamError> {
        tracing::info!(url = %self.config.event_url, "starting event stream");
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }

            let err = self.connect_and_read(&cancel).await;
            self.connected.send_replace(false);
            if err.is_cancelled() {
                tracing::info!("event stream cancelled");
                return Err(err);
            }
            tracing::warn!(
                error = %err,
                retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                "event stream disconnected"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn connect_and_read(&self, cancel: &CancellationToken) -> StreamError {
        let request = self
            .http_client
            .get(&self.config.event_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        let response = tokio::select! {
            _ = cancel.cancelled() => return StreamError::Cancelled,
            response = request.send() => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => return StreamError::Connect(err),
        };
        if !response.status().is_success() {
            return StreamError::Status(response.status().as_u16());
        }

        tracing::info!(url = %self.config.event_url, "connected to event stream");
        self.connected.send_replace(true);

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return StreamError::Cancelled,
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return StreamError::Read(err),
                None => return StreamError::Closed,
            };
            let payloads = decoder.push(&chunk);
            let handled = async {
                for payload in &payloads {
                    self.handle_payload(payload).await;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return StreamError::Cancelled,
                _ = handled => {}
            }
        }
    }

    /// Decodes one frame payload and routes it. Malformed payloads are
    /// logged and dropped.
    pub async fn handle_payload(&self, payload: &str) {
        match decode_event(payload) {
            Ok(event) => self.handle_event(event).await,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    bytes = payload.len(),
                    "discarding malformed event"
                );
            }
        }
    }

    pub async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::PartUpdated(part) => {
                let changed = self
                    .registry
                    .update(&part.session_id, |state| state.apply_snapshot(&part))
                    .await;
                self.after_update(&part.session_id, changed).await;
            }
            RelayEvent::PartDelta(delta) => {
                let changed = self
                    .registry
                    .update(&delta.session_id, |state| state.apply_delta(&delta))
                    .await;
                self.after_update(&delta.session_id, changed).await;
            }
            RelayEvent::MessageUpdated(info) => {
                if !info.is_completed() {
                    return;
                }
                if self
                    .dispatcher
                    .emit_final(&self.registry, &info.session_id)
                    .await
                {
                    tracing::info!(
                        session_id = %info.session_id,
                        finish = info.finish.as_deref().unwrap_or_default(),
                        "response complete"
                    );
                } else {
                    tracing::trace!(session_id = %info.session_id, "completion for untracked session");
                }
            }
            RelayEvent::System(event_type) => {
                tracing::trace!(event_type = %event_type, "ignoring system event");
            }
            RelayEvent::Unknown(event_type) => {
                tracing::debug!(event_type = %event_type, "unhandled event");
            }
        }
    }

    async fn after_update(&self, session_id: &str, changed: Option<bool>) {
        match changed {
            Some(true) => {
                self.dispatcher
                    .emit_throttled(&self.registry, session_id)
                    .await
            }
            Some(false) => {}
            None => tracing::trace!(session_id = %session_id, "event for untracked session"),
        }
    }
}
