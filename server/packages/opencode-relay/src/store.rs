//! Per-chat conversation state persisted as a JSON file: which OpenCode
//! session a chat continues, plus its agent and model preferences.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use opencode_relay_client::ModelRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode chat records: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl ChatRecord {
    fn new(chat_id: i64) -> Self {
        let now = Utc::now();
        Self {
            chat_id,
            session_id: None,
            title: String::new(),
            agent: None,
            model: None,
            message_count: 0,
            created_at: now,
            last_used: now,
        }
    }
}

/// Title given to sessions created on behalf of a chat.
pub fn session_title(chat_id: i64) -> String {
    format!("Telegram Chat {chat_id}")
}

#[derive(Debug)]
pub struct SessionStore {
    path: Option<PathBuf>,
    chats: Mutex<BTreeMap<i64, ChatRecord>>,
}

impl SessionStore {
    /// Loads the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records: Vec<ChatRecord> = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        tracing::debug!(path = %path.display(), chats = records.len(), "loaded chat store");
        Ok(Self {
            path: Some(path),
            chats: Mutex::new(
                records
                    .into_iter()
                    .map(|record| (record.chat_id, record))
                    .collect(),
            ),
        })
    }

    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            chats: Mutex::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, chat_id: i64) -> Option<ChatRecord> {
        self.chats.lock().await.get(&chat_id).cloned()
    }

    pub async fn session_id(&self, chat_id: i64) -> Option<String> {
        self.get(chat_id).await.and_then(|record| record.session_id)
    }

    /// Chats ordered by most recent use.
    pub async fn list(&self) -> Vec<ChatRecord> {
        let mut records: Vec<_> = self.chats.lock().await.values().cloned().collect();
        records.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        records
    }

    /// Points a chat at `session_id`. The message count restarts when the
    /// session changes; agent and model preferences are kept.
    pub async fn bind_session(
        &self,
        chat_id: i64,
        session_id: &str,
        title: &str,
    ) -> Result<ChatRecord, StoreError> {
        self.mutate(|chats| {
            let record = chats
                .entry(chat_id)
                .or_insert_with(|| ChatRecord::new(chat_id));
            if record.session_id.as_deref() != Some(session_id) {
                record.session_id = Some(session_id.to_string());
                record.message_count = 0;
            }
            record.title = title.to_string();
            record.last_used = Utc::now();
            record.clone()
        })
        .await
    }

    /// Detaches the chat from its session and returns the old session id.
    pub async fn clear_session(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
        self.mutate(|chats| {
            let record = chats.get_mut(&chat_id)?;
            record.title.clear();
            record.message_count = 0;
            record.session_id.take()
        })
        .await
    }

    /// Detaches every chat bound to `session_id`.
    pub async fn forget_session(&self, session_id: &str) -> Result<usize, StoreError> {
        self.mutate(|chats| {
            let mut cleared = 0;
            for record in chats.values_mut() {
                if record.session_id.as_deref() == Some(session_id) {
                    record.session_id = None;
                    record.title.clear();
                    record.message_count = 0;
                    cleared += 1;
                }
            }
            cleared
        })
        .await
    }

    pub async fn set_title(&self, chat_id: i64, title: &str) -> Result<(), StoreError> {
        self.mutate(|chats| {
            if let Some(record) = chats.get_mut(&chat_id) {
                record.title = title.to_string();
            }
        })
        .await
    }

    pub async fn set_agent(&self, chat_id: i64, agent: Option<String>) -> Result<(), StoreError> {
        self.mutate(|chats| {
            let record = chats
                .entry(chat_id)
                .or_insert_with(|| ChatRecord::new(chat_id));
            record.agent = agent;
            record.last_used = Utc::now();
        })
        .await
    }

    pub async fn set_model(&self, chat_id: i64, model: Option<ModelRef>) -> Result<(), StoreError> {
        self.mutate(|chats| {
            let record = chats
                .entry(chat_id)
                .or_insert_with(|| ChatRecord::new(chat_id));
            record.model = model;
            record.last_used = Utc::now();
        })
        .await
    }

    /// Counts one prompt sent from the chat.
    pub async fn record_message(&self, chat_id: i64) -> Result<(), StoreError> {
        self.mutate(|chats| {
            if let Some(record) = chats.get_mut(&chat_id) {
                record.message_count += 1;
                record.last_used = Utc::now();
            }
        })
        .await
    }

    pub async fn remove(&self, chat_id: i64) -> Result<Option<ChatRecord>, StoreError> {
        self.mutate(|chats| chats.remove(&chat_id)).await
    }

    /// Drops every record and returns how many there were.
    pub async fn clear_all(&self) -> Result<usize, StoreError> {
        self.mutate(|chats| {
            let count = chats.len();
            chats.clear();
            count
        })
        .await
    }

    async fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut BTreeMap<i64, ChatRecord>) -> R,
    ) -> Result<R, StoreError> {
        let mut chats = self.chats.lock().await;
        let result = apply(&mut chats);
        if let Some(path) = &self.path {
            persist(path, &chats)?;
        }
        Ok(result)
    }
}

fn persist(path: &Path, chats: &BTreeMap<i64, ChatRecord>) -> Result<(), StoreError> {
    let records: Vec<&ChatRecord> = chats.values().collect();
    let content = serde_json::to_string_pretty(&records)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StoreError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content).map_err(|source| StoreError::Write {
        path: staging.clone(),
        source,
    })?;
    fs::rename(&staging, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Default store location under the user data directory.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("opencode-relay").join("chats.json"))
        .unwrap_or_else(|| PathBuf::from(".").join(".opencode-relay").join("chats.json"))
}
