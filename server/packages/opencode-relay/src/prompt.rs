//! One prompt round trip: placeholder message, async submission and the
//! streamed edits that follow until the response completes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opencode_relay_client::{ClientError, ModelRef, OpenCodeClient, PromptRequest};
use opencode_relay_stream::assembler::STATUS_THINKING;
use opencode_relay_stream::{Destination, MessageSink, SinkError, StreamError, StreamRelay};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::{session_title, SessionStore, StoreError};

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("opencode request failed: {0}")]
    Client(#[from] ClientError),
    #[error("failed to post placeholder message: {0}")]
    Placeholder(#[from] SinkError),
    #[error("event stream stopped: {0}")]
    Stream(#[from] StreamError),
    #[error("event stream task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to update chat store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PromptJob {
    pub destination: Destination,
    /// Existing session to continue; a new one is created when absent.
    pub session_id: Option<String>,
    pub request: PromptRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Completed { session_id: String },
    Interrupted { session_id: String },
}

impl PromptOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Completed { session_id } | Self::Interrupted { session_id } => session_id,
        }
    }
}

/// Runs one prompt and relays its streamed response until completion or
/// until `shutdown` resolves. On shutdown the upstream session is aborted.
pub async fn run_prompt<S>(
    client: &OpenCodeClient,
    relay: Arc<StreamRelay>,
    sink: &dyn MessageSink,
    job: PromptJob,
    shutdown: S,
) -> Result<PromptOutcome, PromptError>
where
    S: Future<Output = ()>,
{
    let session_id = match job.session_id {
        Some(session_id) => session_id,
        None => {
            let title = session_title(job.destination.chat_id);
            client.create_session(&title).await?.id
        }
    };

    let placeholder = sink
        .create(job.destination, STATUS_THINKING.to_string())
        .await?;
    relay
        .register(&session_id, job.destination, Some(placeholder))
        .await;

    let cancel = CancellationToken::new();
    let mut connected = relay.subscribe_connection();
    let stream_task = spawn_stream(relay.clone(), cancel.clone());

    tokio::pin!(shutdown);
    let outcome = tokio::select! {
        _ = &mut shutdown => None,
        result = connected.wait_for(|up| *up) => {
            if result.is_err() {
                tracing::warn!("event stream status channel closed before connecting");
            }
            Some(())
        }
    };
    if outcome.is_none() {
        return interrupt(client, &relay, session_id, cancel, stream_task).await;
    }

    if let Err(err) = client.prompt_async(&session_id, &job.request).await {
        relay.unregister(&session_id).await;
        stop_stream(cancel, stream_task).await?;
        return Err(err.into());
    }
    tracing::info!(session_id = %session_id, chat_id = job.destination.chat_id, "prompt submitted");

    let completed = tokio::select! {
        _ = &mut shutdown => false,
        _ = wait_for_completion(&relay, &session_id) => true,
    };
    if !completed {
        return interrupt(client, &relay, session_id, cancel, stream_task).await;
    }

    stop_stream(cancel, stream_task).await?;
    Ok(PromptOutcome::Completed { session_id })
}

/// A prompt sent on behalf of a chat. Unset fields fall back to what the
/// chat store holds for the chat.
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub chat_id: i64,
    pub text: String,
    pub session_id: Option<String>,
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
}

/// Runs [`run_prompt`] for a chat, continuing the session the store binds
/// it to, then records the session and the message in the store.
pub async fn run_chat_prompt<S>(
    client: &OpenCodeClient,
    relay: Arc<StreamRelay>,
    sink: &dyn MessageSink,
    store: &SessionStore,
    prompt: ChatPrompt,
    shutdown: S,
) -> Result<PromptOutcome, PromptError>
where
    S: Future<Output = ()>,
{
    let record = store.get(prompt.chat_id).await;
    let (stored_session, stored_title, stored_agent, stored_model) = match record {
        Some(record) => (record.session_id, record.title, record.agent, record.model),
        None => (None, String::new(), None, None),
    };
    let session_id = prompt.session_id.or(stored_session.clone());
    let job = PromptJob {
        destination: Destination::new(prompt.chat_id),
        session_id,
        request: PromptRequest::text(prompt.text)
            .with_agent(prompt.agent.or(stored_agent))
            .with_model(prompt.model.or(stored_model)),
    };

    let outcome = run_prompt(client, relay, sink, job, shutdown).await?;
    let title = if stored_session.as_deref() == Some(outcome.session_id()) && !stored_title.is_empty() {
        stored_title
    } else {
        session_title(prompt.chat_id)
    };
    store
        .bind_session(prompt.chat_id, outcome.session_id(), &title)
        .await?;
    store.record_message(prompt.chat_id).await?;
    Ok(outcome)
}

fn spawn_stream(
    relay: Arc<StreamRelay>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), StreamError>> {
    tokio::spawn(async move { relay.run(cancel).await })
}

async fn wait_for_completion(relay: &StreamRelay, session_id: &str) {
    let mut interval = tokio::time::interval(COMPLETION_POLL_INTERVAL);
    loop {
        interval.tick().await;
        if !relay.registry().is_registered(session_id).await {
            return;
        }
    }
}

async fn interrupt(
    client: &OpenCodeClient,
    relay: &StreamRelay,
    session_id: String,
    cancel: CancellationToken,
    stream_task: JoinHandle<Result<(), StreamError>>,
) -> Result<PromptOutcome, PromptError> {
    tracing::info!(session_id = %session_id, "interrupted; aborting session");
    if let Err(err) = client.abort(&session_id).await {
        tracing::warn!(session_id = %session_id, error = %err, "failed to abort session");
    }
    relay.unregister(&session_id).await;
    stop_stream(cancel, stream_task).await?;
    Ok(PromptOutcome::Interrupted { session_id })
}

async fn stop_stream(
    cancel: CancellationToken,
    stream_task: JoinHandle<Result<(), StreamError>>,
) -> Result<(), PromptError> {
    cancel.cancel();
    match stream_task.await? {
        Ok(()) | Err(StreamError::Cancelled) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
