//! Telegram Bot API client. Implements [`MessageSink`] for the relay and
//! carries the long-polling and housekeeping calls the chat bot needs.

use std::time::Duration;

use opencode_relay_stream::{Destination, MessageHandle, MessageSink, SinkError, SinkFuture};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Upper bound for one send or edit round trip.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const NOT_MODIFIED_MARKER: &str = "message is not modified";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

#[derive(Debug, Serialize)]
struct SendChatAction<'a> {
    chat_id: i64,
    action: &'a str,
}

#[derive(Debug, Serialize)]
struct BotCommandEntry<'a> {
    command: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct SetMyCommands<'a> {
    commands: Vec<BotCommandEntry<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// One entry from `getUpdates`. Only message updates are requested.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone)]
pub struct TelegramApi {
    http_client: Client,
    api_url: String,
    token: String,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Result<Self, SinkError> {
        Self::with_api_url(token, DEFAULT_TELEGRAM_API_URL)
    }

    pub fn with_api_url(token: impl Into<String>, api_url: &str) -> Result<Self, SinkError> {
        Self::with_timeout(token, api_url, SEND_TIMEOUT)
    }

    /// `timeout` bounds every call except `getUpdates`, which waits for
    /// its own long-poll window.
    pub fn with_timeout(
        token: impl Into<String>,
        api_url: &str,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        Ok(Self {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    /// Long-polls for message updates starting at `offset`.
    pub async fn get_updates(
        &self,
        offset: i64,
        poll_timeout: Duration,
    ) -> Result<Vec<Update>, SinkError> {
        let body = GetUpdates {
            offset,
            timeout: poll_timeout.as_secs(),
            allowed_updates: ["message"],
        };
        let updates: Option<Vec<Update>> = self
            .call("getUpdates", &body, Some(poll_timeout + SEND_TIMEOUT))
            .await?;
        Ok(updates.unwrap_or_default())
    }

    pub async fn send_text(&self, chat_id: i64, text: &str) -> Result<MessageHandle, SinkError> {
        let body = SendMessage { chat_id, text };
        let sent: Option<SentMessage> = self.call("sendMessage", &body, None).await?;
        let sent = sent.ok_or_else(|| SinkError::Rejected {
            status: 200,
            description: "sendMessage returned no message".to_string(),
        })?;
        Ok(MessageHandle(sent.message_id))
    }

    pub async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), SinkError> {
        let body = EditMessageText {
            chat_id,
            message_id,
            text,
        };
        self.call::<_, serde_json::Value>("editMessageText", &body, None)
            .await?;
        Ok(())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), SinkError> {
        let body = SendChatAction { chat_id, action };
        self.call::<_, serde_json::Value>("sendChatAction", &body, None)
            .await?;
        Ok(())
    }

    /// Publishes the command menu shown by Telegram clients.
    pub async fn set_my_commands(&self, commands: &[(&str, &str)]) -> Result<(), SinkError> {
        let body = SetMyCommands {
            commands: commands
                .iter()
                .map(|&(command, description)| BotCommandEntry {
                    command,
                    description,
                })
                .collect(),
        };
        self.call::<_, serde_json::Value>("setMyCommands", &body, None)
            .await?;
        Ok(())
    }

    async fn call<B, T>(
        &self,
        method: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, SinkError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http_client.post(self.method_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.without_url().to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SinkError::Transport(err.without_url().to_string()))?;
        let parsed: ApiResponse<T> =
            serde_json::from_slice(&bytes).map_err(|err| SinkError::Rejected {
                status,
                description: format!("unreadable response: {err}"),
            })?;
        if parsed.ok {
            return Ok(parsed.result);
        }
        Err(classify_failure(
            parsed.error_code.unwrap_or(status),
            parsed.description.unwrap_or_default(),
        ))
    }
}

fn classify_failure(status: u16, description: String) -> SinkError {
    if description.contains(NOT_MODIFIED_MARKER) {
        SinkError::NotModified
    } else {
        SinkError::Rejected {
            status,
            description,
        }
    }
}

impl MessageSink for TelegramApi {
    fn create(&self, destination: Destination, text: String) -> SinkFuture<'_, MessageHandle> {
        Box::pin(async move { self.send_text(destination.chat_id, &text).await })
    }

    fn update(
        &self,
        destination: Destination,
        handle: MessageHandle,
        text: String,
    ) -> SinkFuture<'_, ()> {
        Box::pin(async move { self.edit_text(destination.chat_id, handle.0, &text).await })
    }
}
