//! Long-polling Telegram bot. Chat commands manage the OpenCode session a
//! chat is bound to; any other text becomes a prompt whose response is
//! streamed into a placeholder message by the shared [`StreamRelay`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use opencode_relay_client::{ClientError, ModelRef, OpenCodeClient, PromptRequest};
use opencode_relay_stream::assembler::STATUS_THINKING;
use opencode_relay_stream::{Destination, SinkError, StreamRelay};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::access::{AccessPolicy, RateLimiter, DEFAULT_PROMPT_INTERVAL};
use crate::commands::{help_text, parse_incoming, BotCommand, Incoming};
use crate::render;
use crate::store::{session_title, SessionStore, StoreError};
use crate::telegram::{TelegramApi, Update};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

pub const UNAUTHORIZED_REPLY: &str = "Unauthorized. You are not allowed to use this bot.";
pub const RATE_LIMITED_REPLY: &str = "Please wait a moment before sending another message.";
pub const NO_SESSION_REPLY: &str = "No active session. Send a message first.";

#[derive(Debug, Error)]
pub enum BotError {
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Telegram(#[from] SinkError),
}

/// Agents offered by `/agent`, keyed by name.
pub fn default_agents() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("build".to_string(), "General coding".to_string()),
        ("plan".to_string(), "Planning and analysis".to_string()),
    ])
}

/// Parses `name:description,name:description`. A bare name is its own
/// description.
pub fn parse_agents(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            let (name, description) = match pair.split_once(':') {
                Some((name, description)) => (name.trim(), description.trim()),
                None => (pair, pair),
            };
            (!name.is_empty()).then(|| (name.to_string(), description.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub poll_timeout: Duration,
    pub retry_delay: Duration,
    pub prompt_interval: Duration,
    pub agents: BTreeMap<String, String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry_delay: DEFAULT_POLL_RETRY_DELAY,
            prompt_interval: DEFAULT_PROMPT_INTERVAL,
            agents: default_agents(),
        }
    }
}

pub struct ChatBot {
    client: OpenCodeClient,
    api: Arc<TelegramApi>,
    relay: Arc<StreamRelay>,
    store: Arc<SessionStore>,
    access: AccessPolicy,
    limiter: RateLimiter,
    config: BotConfig,
    started: Instant,
}

impl ChatBot {
    pub fn new(
        client: OpenCodeClient,
        api: Arc<TelegramApi>,
        relay: Arc<StreamRelay>,
        store: Arc<SessionStore>,
        access: AccessPolicy,
        config: BotConfig,
    ) -> Self {
        Self {
            client,
            api,
            relay,
            store,
            access,
            limiter: RateLimiter::new(config.prompt_interval),
            config,
            started: Instant::now(),
        }
    }

    /// Polls for updates and handles them in order until `cancel` fires.
    /// The relay's event stream must be running separately.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("polling telegram for updates");
        let mut offset = 0;
        'poll: loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break 'poll,
                polled = self.api.get_updates(offset, self.config.poll_timeout) => polled,
            };
            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        tokio::select! {
                            _ = cancel.cancelled() => break 'poll,
                            _ = self.handle_update(update) => {}
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retry_in_ms = self.config.retry_delay.as_millis() as u64,
                        "failed to poll telegram updates"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break 'poll,
                        _ = sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }
        tracing::info!("stopped polling telegram");
    }

    pub async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text else {
            return;
        };
        self.handle_message(message.chat.id, &text).await;
    }

    pub async fn handle_message(&self, chat_id: i64, text: &str) {
        let Some(incoming) = parse_incoming(text) else {
            return;
        };
        if !self.access.is_allowed(chat_id) {
            tracing::warn!(chat_id, "rejected message from unauthorized chat");
            self.reply(chat_id, UNAUTHORIZED_REPLY).await;
            return;
        }
        let command = match incoming {
            Incoming::Prompt(prompt) => return self.prompt(chat_id, &prompt).await,
            Incoming::Command(command) => command,
        };
        let reply = match self.execute(chat_id, command).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(chat_id, error = %err, "command failed");
                format!("Error: {err}")
            }
        };
        self.reply(chat_id, &reply).await;
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.api.send_text(chat_id, text).await {
            tracing::warn!(chat_id, error = %err, "failed to send reply");
        }
    }

    async fn execute(&self, chat_id: i64, command: BotCommand) -> Result<String, BotError> {
        match command {
            BotCommand::Start => {
                self.store.clear_session(chat_id).await?;
                Ok(help_text())
            }
            BotCommand::Help => Ok(help_text()),
            BotCommand::New => {
                self.store.clear_session(chat_id).await?;
                Ok("New conversation started! Send a message to begin.".to_string())
            }
            BotCommand::Stop => self.stop(chat_id).await,
            BotCommand::Clear => self.clear(chat_id).await,
            BotCommand::Sessions => {
                let sessions = self.client.list_sessions().await?;
                let current = self.store.session_id(chat_id).await;
                Ok(render::session_list(&sessions, current.as_deref()))
            }
            BotCommand::Switch(None) => Ok("Usage: /switch <session_id>".to_string()),
            BotCommand::Switch(Some(session_id)) => self.switch(chat_id, &session_id).await,
            BotCommand::Rename(None) => Ok("Usage: /rename <new title>".to_string()),
            BotCommand::Rename(Some(title)) => self.rename(chat_id, &title).await,
            BotCommand::Delete(target) => self.delete(chat_id, target).await,
            BotCommand::Purge => self.purge(chat_id).await,
            BotCommand::Diff => match self.store.session_id(chat_id).await {
                Some(session_id) => Ok(render::diff(&self.client.diff(&session_id).await?)),
                None => Ok(NO_SESSION_REPLY.to_string()),
            },
            BotCommand::History => match self.store.session_id(chat_id).await {
                Some(session_id) => Ok(render::history(
                    &self.client.messages(&session_id).await?,
                )),
                None => Ok(NO_SESSION_REPLY.to_string()),
            },
            BotCommand::Model(choice) => self.model(chat_id, choice).await,
            BotCommand::Agent(choice) => self.agent(chat_id, choice).await,
            BotCommand::Status => Ok(self.status(chat_id).await),
            BotCommand::Stats => {
                let records = self.store.list().await;
                let messages: u64 = records.iter().map(|record| record.message_count).sum();
                let sessions = records
                    .iter()
                    .filter(|record| record.session_id.is_some())
                    .count();
                Ok(format!(
                    "Statistics\n\nTotal messages: {messages}\nActive sessions: {sessions}"
                ))
            }
            BotCommand::Unknown(name) => Ok(format!(
                "Unknown command /{name}. Use /help to see available commands."
            )),
        }
    }

    async fn stop(&self, chat_id: i64) -> Result<String, BotError> {
        let Some(session_id) = self.store.session_id(chat_id).await else {
            return Ok(NO_SESSION_REPLY.to_string());
        };
        self.client.abort(&session_id).await?;
        self.relay.unregister(&session_id).await;
        Ok("Stopped.".to_string())
    }

    async fn clear(&self, chat_id: i64) -> Result<String, BotError> {
        let removed = self.store.remove(chat_id).await?;
        if let Some(session_id) = removed.and_then(|record| record.session_id) {
            self.relay.unregister(&session_id).await;
            if let Err(err) = self.client.delete_session(&session_id).await {
                tracing::warn!(chat_id, session_id = %session_id, error = %err, "failed to delete session");
            }
        }
        Ok("Data cleared!".to_string())
    }

    async fn switch(&self, chat_id: i64, session_id: &str) -> Result<String, BotError> {
        let session = match self.client.get_session(session_id).await {
            Ok(session) => session,
            Err(ClientError::Status { .. }) => {
                return Ok(format!("Session not found: {session_id}"));
            }
            Err(err) => return Err(err.into()),
        };
        self.store
            .bind_session(chat_id, &session.id, &session.title)
            .await?;
        Ok(format!("Switched to session: {}", render::short_id(&session.id)))
    }

    async fn rename(&self, chat_id: i64, title: &str) -> Result<String, BotError> {
        let Some(session_id) = self.store.session_id(chat_id).await else {
            return Ok(NO_SESSION_REPLY.to_string());
        };
        let session = self.client.rename_session(&session_id, title).await?;
        let title = if session.title.is_empty() {
            title
        } else {
            session.title.as_str()
        };
        self.store.set_title(chat_id, title).await?;
        Ok(format!("Session renamed to: {title}"))
    }

    async fn delete(&self, chat_id: i64, target: Option<String>) -> Result<String, BotError> {
        let session_id = match target {
            Some(session_id) => session_id,
            None => match self.store.session_id(chat_id).await {
                Some(session_id) => session_id,
                None => return Ok("No active session to delete".to_string()),
            },
        };
        self.client.delete_session(&session_id).await?;
        self.relay.unregister(&session_id).await;
        self.store.forget_session(&session_id).await?;
        Ok(format!("Deleted session: {}", render::short_id(&session_id)))
    }

    async fn purge(&self, chat_id: i64) -> Result<String, BotError> {
        if !self.access.is_admin(chat_id) {
            tracing::warn!(chat_id, "purge refused for non-admin chat");
            return Ok("Admin only command".to_string());
        }
        let sessions = self.client.list_sessions().await?;
        let mut deleted = 0;
        for session in &sessions {
            self.relay.unregister(&session.id).await;
            match self.client.delete_session(&session.id).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    tracing::warn!(session_id = %session.id, error = %err, "failed to delete session");
                }
            }
        }
        self.store.clear_all().await?;
        tracing::info!(chat_id, deleted, "purged sessions");
        Ok(format!("All sessions purged! ({deleted} deleted)"))
    }

    async fn model(&self, chat_id: i64, choice: Option<String>) -> Result<String, BotError> {
        let Some(choice) = choice else {
            let current = self.store.get(chat_id).await.and_then(|record| record.model);
            return Ok(format!(
                "Current model: {}\nUse /model provider/model to change it, or /model default to reset.",
                render::model_label(current.as_ref())
            ));
        };
        if choice == "default" {
            self.store.set_model(chat_id, None).await?;
            return Ok("Model reset to server default".to_string());
        }
        let Some(model) = ModelRef::parse(&choice) else {
            return Ok(
                "Invalid format. Use /model provider/model (e.g., /model openai/gpt-4)".to_string(),
            );
        };
        let label = model.to_string();
        self.store.set_model(chat_id, Some(model)).await?;
        Ok(format!("Model set to: {label}"))
    }

    async fn agent(&self, chat_id: i64, choice: Option<String>) -> Result<String, BotError> {
        let Some(name) = choice else {
            let current = self.store.get(chat_id).await.and_then(|record| record.agent);
            let mut text = String::from("Available agents:\n");
            for (name, description) in &self.config.agents {
                let marker = if current.as_deref() == Some(name.as_str()) {
                    " [active]"
                } else {
                    ""
                };
                text.push_str(&format!("{name} - {description}{marker}\n"));
            }
            text.push_str("\nUse /agent <name> to switch");
            return Ok(text);
        };
        let Some(description) = self.config.agents.get(&name) else {
            return Ok(format!("Unknown agent: {name}"));
        };
        self.store.set_agent(chat_id, Some(name.clone())).await?;
        Ok(format!("Agent set to: {name} ({description})"))
    }

    async fn status(&self, chat_id: i64) -> String {
        let mut text = format!(
            "Bot Status\n\nUptime: {}\nActive streams: {}",
            render::uptime(self.started.elapsed()),
            self.relay.active_count().await
        );
        if let Some(record) = self.store.get(chat_id).await {
            if let Some(session_id) = &record.session_id {
                text.push_str(&format!("\nSession: {}", render::short_id(session_id)));
            }
            text.push_str(&format!(
                "\nModel: {}\nAgent: {}\nMessages: {}",
                render::model_label(record.model.as_ref()),
                render::agent_label(record.agent.as_deref()),
                record.message_count
            ));
        }
        text
    }

    async fn prompt(&self, chat_id: i64, text: &str) {
        if !self.limiter.try_acquire(chat_id) {
            self.reply(chat_id, RATE_LIMITED_REPLY).await;
            return;
        }
        if let Err(err) = self.api.send_chat_action(chat_id, "typing").await {
            tracing::debug!(chat_id, error = %err, "failed to send typing action");
        }
        if let Err(err) = self.submit_prompt(chat_id, text).await {
            tracing::warn!(chat_id, error = %err, "failed to start prompt");
            self.reply(chat_id, &format!("Error: {err}")).await;
        }
    }

    async fn submit_prompt(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        let record = self.store.get(chat_id).await;
        let (session_id, agent, model) = match record {
            Some(record) => (record.session_id, record.agent, record.model),
            None => (None, None, None),
        };
        let session_id = match session_id {
            Some(session_id) => session_id,
            None => {
                let title = session_title(chat_id);
                let session = self.client.create_session(&title).await?;
                self.store
                    .bind_session(chat_id, &session.id, &title)
                    .await?;
                session.id
            }
        };
        self.store.record_message(chat_id).await?;

        let placeholder = self.api.send_text(chat_id, STATUS_THINKING).await?;
        self.relay
            .register(&session_id, Destination::new(chat_id), Some(placeholder))
            .await;

        let request = PromptRequest::text(text)
            .with_agent(agent)
            .with_model(model);
        if let Err(err) = self.client.prompt_async(&session_id, &request).await {
            tracing::warn!(chat_id, session_id = %session_id, error = %err, "prompt rejected");
            self.relay.unregister(&session_id).await;
            if let Err(edit_err) = self
                .api
                .edit_text(chat_id, placeholder.0, &format!("Error: {err}"))
                .await
            {
                tracing::warn!(chat_id, error = %edit_err, "failed to report prompt error");
            }
            return Ok(());
        }
        tracing::info!(chat_id, session_id = %session_id, "prompt submitted");
        Ok(())
    }
}
