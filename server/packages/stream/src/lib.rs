//! Streaming relay between the OpenCode event feed and chat destinations.

use std::time::Duration;

pub mod assembler;
pub mod codec;
mod connection;
pub mod dispatcher;
pub mod registry;
pub mod sink;

pub use assembler::AssemblyState;
pub use codec::{RelayEvent, SseDecoder};
pub use connection::{StreamError, StreamRelay};
pub use registry::SessionRegistry;
pub use sink::{Destination, MessageHandle, MessageSink, SinkError, SinkFuture};

pub const DEFAULT_BASE_URL: &str = "http://localhost:4096";
pub const DEFAULT_EDIT_THROTTLE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_DISPLAY_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Full URL of the server-sent event endpoint.
    pub event_url: String,
    /// Minimum interval between non-final edits of one destination.
    pub edit_throttle: Duration,
    /// Fixed wait before reconnecting a dropped stream.
    pub reconnect_delay: Duration,
    pub max_display_chars: usize,
}

impl RelayConfig {
    pub fn for_base_url(base_url: &str) -> Self {
        Self {
            event_url: format!("{}/event", base_url.trim_end_matches('/')),
            edit_throttle: DEFAULT_EDIT_THROTTLE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_display_chars: DEFAULT_MAX_DISPLAY_CHARS,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::for_base_url(DEFAULT_BASE_URL)
    }
}
