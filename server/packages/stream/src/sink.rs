use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Chat that receives rendered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub chat_id: i64,
}

impl Destination {
    pub fn new(chat_id: i64) -> Self {
        Self { chat_id }
    }
}

/// Handle of a message previously created in a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub i64);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("message content is unchanged")]
    NotModified,
    #[error("destination rejected the request ({status}): {description}")]
    Rejected { status: u16, description: String },
    #[error("destination transport failed: {0}")]
    Transport(String),
}

impl SinkError {
    /// Benign failures mean the destination already shows the requested text.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }
}

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Output capability supplied by the caller.
///
/// The relay never retries a failed call; the next state change for the
/// conversation produces a fresh attempt.
pub trait MessageSink: Send + Sync + 'static {
    /// Post a new message and return its handle.
    fn create(&self, destination: Destination, text: String) -> SinkFuture<'_, MessageHandle>;

    /// Replace the text of an existing message.
    fn update(
        &self,
        destination: Destination,
        handle: MessageHandle,
        text: String,
    ) -> SinkFuture<'_, ()>;
}
