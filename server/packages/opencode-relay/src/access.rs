//! Who may talk to the bot and how often.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between two prompts from the same chat.
pub const DEFAULT_PROMPT_INTERVAL: Duration = Duration::from_secs(2);

/// Chat allow-list and admin list. An empty list admits everyone.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: HashSet<i64>,
    admins: HashSet<i64>,
}

impl AccessPolicy {
    pub fn new(allowed: impl IntoIterator<Item = i64>, admins: impl IntoIterator<Item = i64>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            admins: admins.into_iter().collect(),
        }
    }

    pub fn is_allowed(&self, chat_id: i64) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&chat_id)
    }

    pub fn is_admin(&self, chat_id: i64) -> bool {
        self.admins.is_empty() || self.admins.contains(&chat_id)
    }
}

/// Parses a comma separated id list. Entries that are not integers are
/// logged and skipped.
pub fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<i64>() {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(entry = %entry, error = %err, "ignoring invalid chat id");
                None
            }
        })
        .collect()
}

/// Per-chat prompt rate limit.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_seen: Mutex<HashMap<i64, Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_seen: Mutex::default(),
        }
    }

    /// Records an attempt and returns whether it is allowed.
    pub fn try_acquire(&self, chat_id: i64) -> bool {
        let now = Instant::now();
        let mut last_seen = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last_seen.retain(|_, at| now.saturating_duration_since(*at) < self.interval);
        if last_seen.contains_key(&chat_id) {
            return false;
        }
        last_seen.insert(chat_id, now);
        true
    }
}
