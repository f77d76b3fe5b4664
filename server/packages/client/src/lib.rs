//! Request/response client for the OpenCode HTTP API.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("OpenCode server reports unhealthy")]
    Unhealthy,
    #[error("OpenCode rejected the prompt")]
    Unsuccessful,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "projectID", default)]
    pub project_id: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub time: SessionTime,
}

/// A message flattened to its visible text.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSummary {
    pub id: String,
    pub role: String,
    pub content: String,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// Parses `provider/model`. Both halves must be non-empty.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Some(Self {
                provider_id: provider.to_string(),
                model_id: model.to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PromptPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PromptRequest {
    pub parts: Vec<PromptPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

impl PromptRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![PromptPart {
                kind: "text".to_string(),
                text: text.into(),
            }],
            agent: None,
            model: None,
        }
    }

    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent.filter(|name| !name.is_empty());
        self
    }

    pub fn with_model(mut self, model: Option<ModelRef>) -> Self {
        self.model = model;
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    info: RawMessageInfo,
    #[serde(default)]
    parts: Vec<RawMessagePart>,
}

#[derive(Debug, Deserialize)]
struct RawMessageInfo {
    id: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    tokens: Option<RawTokens>,
    #[serde(default)]
    cost: f64,
}

#[derive(Debug, Deserialize)]
struct RawTokens {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
}

#[derive(Debug, Deserialize)]
struct RawMessagePart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    base_url: String,
    http_client: Client,
}

impl OpenCodeClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Request {
                path: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let path = "/global/health";
        let health: HealthResponse = self.get_json(path).await?;
        if !health.healthy {
            return Err(ClientError::Unhealthy);
        }
        Ok(health)
    }

    pub async fn create_session(&self, title: &str) -> Result<Session, ClientError> {
        let path = "/session";
        let body = serde_json::json!({ "title": title });
        let response = self
            .send(path, self.request(Method::POST, path).json(&body))
            .await?;
        let session: Session = decode(path, response).await?;
        tracing::info!(session_id = %session.id, title = %title, "created OpenCode session");
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        self.get_json("/session").await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ClientError> {
        self.get_json(&format!("/session/{session_id}")).await
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<Session, ClientError> {
        let path = format!("/session/{session_id}");
        let body = serde_json::json!({ "title": title });
        let response = self
            .send(&path, self.request(Method::PATCH, &path).json(&body))
            .await?;
        decode(&path, response).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        let path = format!("/session/{session_id}");
        self.send(&path, self.request(Method::DELETE, &path))
            .await?;
        tracing::info!(session_id = %session_id, "deleted OpenCode session");
        Ok(())
    }

    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageSummary>, ClientError> {
        let path = format!("/session/{session_id}/message");
        let raw: Vec<RawMessage> = self.get_json(&path).await?;
        Ok(raw.into_iter().map(summarize_message).collect())
    }

    /// Submits a prompt without waiting for the response; output arrives on
    /// the event stream.
    pub async fn prompt_async(
        &self,
        session_id: &str,
        prompt: &PromptRequest,
    ) -> Result<(), ClientError> {
        let path = format!("/session/{session_id}/prompt_async");
        let response = self
            .send(&path, self.request(Method::POST, &path).json(prompt))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .map_err(|source| ClientError::Request {
                path: path.clone(),
                source,
            })?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let outcome: SuccessResponse =
            serde_json::from_str(&body).map_err(|source| ClientError::Decode {
                path: path.clone(),
                source,
            })?;
        if !outcome.success {
            return Err(ClientError::Unsuccessful);
        }
        Ok(())
    }

    pub async fn abort(&self, session_id: &str) -> Result<(), ClientError> {
        let path = format!("/session/{session_id}/abort");
        self.send(&path, self.request(Method::POST, &path)).await?;
        tracing::info!(session_id = %session_id, "aborted OpenCode session");
        Ok(())
    }

    /// Raw diff text of the files changed in a session.
    pub async fn diff(&self, session_id: &str) -> Result<String, ClientError> {
        let path = format!("/session/{session_id}/diff");
        let response = self.send(&path, self.request(Method::GET, &path)).await?;
        response
            .text()
            .await
            .map_err(|source| ClientError::Request { path, source })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http_client
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.send(path, self.request(Method::GET, path)).await?;
        decode(path, response).await
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = request.send().await.map_err(|source| ClientError::Request {
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(path = %path, status = %status, "OpenCode request failed");
            return Err(ClientError::Status {
                path: path.to_string(),
                status,
                body,
            });
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T, ClientError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|source| ClientError::Request {
            path: path.to_string(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode {
        path: path.to_string(),
        source,
    })
}

fn summarize_message(raw: RawMessage) -> MessageSummary {
    let content = raw
        .parts
        .iter()
        .filter(|part| part.kind == "text")
        .filter_map(|part| part.text.as_deref())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let tokens = raw
        .info
        .tokens
        .map(|tokens| tokens.total.unwrap_or(tokens.input + tokens.output))
        .unwrap_or(0);
    MessageSummary {
        id: raw.info.id,
        role: raw.info.role,
        content,
        tokens,
        cost: raw.info.cost,
    }
}
