use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::assembler::AssemblyState;
use crate::sink::{Destination, MessageHandle};

#[derive(Debug)]
struct SessionEntry {
    /// Bumped on every registration so stale sink results never land on a
    /// newer registration of the same session.
    generation: u64,
    destination: Destination,
    message: Option<MessageHandle>,
    state: AssemblyState,
    last_emission: Option<Instant>,
}

/// Text ready to be sent to one destination, captured under the read lock.
#[derive(Debug, Clone)]
pub(crate) struct Emission {
    pub session_id: String,
    pub generation: u64,
    pub destination: Destination,
    pub message: Option<MessageHandle>,
    pub text: String,
}

/// Throttle gate applied when capturing an emission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThrottleGate {
    pub window: Duration,
    pub now: Instant,
}

/// Maps OpenCode session ids to their destination and assembly state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, SessionEntry>>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a session to a destination, resetting any previous state for it.
    pub async fn register(
        &self,
        session_id: &str,
        destination: Destination,
        message: Option<MessageHandle>,
    ) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.write().await.insert(
            session_id.to_string(),
            SessionEntry {
                generation,
                destination,
                message,
                state: AssemblyState::default(),
                last_emission: None,
            },
        );
        tracing::info!(
            session_id = %session_id,
            chat_id = destination.chat_id,
            message_id = message.map(|handle| handle.0),
            "registered session"
        );
    }

    /// Drops a session without a final emission. Returns whether it existed.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let removed = self.entries.write().await.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "unregistered session");
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_registered(&self, session_id: &str) -> bool {
        self.entries.read().await.contains_key(session_id)
    }

    /// Destination and current message handle of a registered session.
    pub async fn destination(&self, session_id: &str) -> Option<(Destination, Option<MessageHandle>)> {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|entry| (entry.destination, entry.message))
    }

    /// Copy of the assembly state of a registered session.
    pub async fn state(&self, session_id: &str) -> Option<AssemblyState> {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.state.clone())
    }

    /// Runs `apply` against the session state under the write lock.
    /// Returns `None` when the session is not registered.
    pub(crate) async fn update<R>(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut AssemblyState) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.write().await;
        entries.get_mut(session_id).map(|entry| apply(&mut entry.state))
    }

    /// Captures the text to emit for a session. `compose` returning `None`
    /// or a closed throttle gate skips the emission.
    pub(crate) async fn capture(
        &self,
        session_id: &str,
        gate: Option<ThrottleGate>,
        compose: impl FnOnce(&AssemblyState) -> Option<String>,
    ) -> Option<Emission> {
        let entries = self.entries.read().await;
        let entry = entries.get(session_id)?;
        if let (Some(gate), Some(last)) = (gate, entry.last_emission) {
            if gate.now.saturating_duration_since(last) < gate.window {
                return None;
            }
        }
        let text = compose(&entry.state)?;
        Some(Emission {
            session_id: session_id.to_string(),
            generation: entry.generation,
            destination: entry.destination,
            message: entry.message,
            text,
        })
    }

    /// Records a delivered emission on the registration it was captured from.
    pub(crate) async fn record_emission(
        &self,
        emission: &Emission,
        handle: Option<MessageHandle>,
        at: Instant,
    ) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&emission.session_id) else {
            return;
        };
        if entry.generation != emission.generation {
            return;
        }
        if handle.is_some() {
            entry.message = handle;
        }
        entry.last_emission = Some(at);
    }

    /// Removes the registration an emission was captured from.
    pub(crate) async fn finish(&self, emission: &Emission) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&emission.session_id) {
            Some(entry) if entry.generation == emission.generation => {
                entries.remove(&emission.session_id);
                true
            }
            _ => false,
        }
    }
}
