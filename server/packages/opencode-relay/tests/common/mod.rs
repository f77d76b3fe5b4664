#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub const BOT_TOKEN: &str = "TEST";
pub const PLACEHOLDER_MESSAGE_ID: i64 = 77;
pub const HANG_PROMPT: &str = "hang";
/// Sends to this chat never get an answer.
pub const UNRESPONSIVE_CHAT: i64 = 408;
/// Sessions with this id report an empty diff.
pub const CLEAN_SESSION: &str = "ses_clean";
pub const SAMPLE_DIFF: &str = "+added line\n";

/// OpenCode server double: prompts are answered on the shared event feed.
#[derive(Clone)]
pub struct OpenCodeMock {
    events: broadcast::Sender<String>,
    pub prompts: Arc<Mutex<Vec<(String, Value)>>>,
    pub aborted: Arc<Mutex<Vec<String>>>,
    pub created: Arc<Mutex<Vec<String>>>,
    pub deleted: Arc<Mutex<Vec<String>>>,
    sessions: Arc<Mutex<Vec<Value>>>,
}

impl Default for OpenCodeMock {
    fn default() -> Self {
        let (events, _rx) = broadcast::channel(64);
        Self {
            events,
            prompts: Arc::default(),
            aborted: Arc::default(),
            created: Arc::default(),
            deleted: Arc::default(),
            sessions: Arc::default(),
        }
    }
}

impl OpenCodeMock {
    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().expect("aborted lock").clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().expect("created lock").clone()
    }

    pub fn prompts(&self) -> Vec<(String, Value)> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted lock").clone()
    }

    pub fn seed_session(&self, id: &str, title: &str) {
        self.sessions
            .lock()
            .expect("sessions lock")
            .push(json!({ "id": id, "title": title }));
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .filter_map(|session| session["id"].as_str().map(str::to_string))
            .collect()
    }
}

fn not_found(session_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "name": "NotFoundError", "data": { "message": format!("session {session_id} not found") } })),
    )
        .into_response()
}

/// The first session created is `ses_cli`, later ones `ses_cli_2` onwards.
async fn create_session(State(mock): State<OpenCodeMock>, Json(body): Json<Value>) -> Json<Value> {
    let title = body["title"].as_str().unwrap_or_default().to_string();
    let mut created = mock.created.lock().expect("created lock");
    created.push(title.clone());
    let id = match created.len() {
        1 => "ses_cli".to_string(),
        n => format!("ses_cli_{n}"),
    };
    let session = json!({ "id": id, "title": title });
    mock.sessions
        .lock()
        .expect("sessions lock")
        .push(session.clone());
    Json(session)
}

async fn list_sessions(State(mock): State<OpenCodeMock>) -> Json<Value> {
    Json(Value::Array(mock.sessions.lock().expect("sessions lock").clone()))
}

async fn get_session(State(mock): State<OpenCodeMock>, Path(session_id): Path<String>) -> Response {
    let sessions = mock.sessions.lock().expect("sessions lock");
    match sessions.iter().find(|session| session["id"] == session_id.as_str()) {
        Some(session) => Json(session.clone()).into_response(),
        None => not_found(&session_id),
    }
}

async fn rename_session(
    State(mock): State<OpenCodeMock>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut sessions = mock.sessions.lock().expect("sessions lock");
    match sessions
        .iter_mut()
        .find(|session| session["id"] == session_id.as_str())
    {
        Some(session) => {
            session["title"] = body["title"].clone();
            Json(session.clone()).into_response()
        }
        None => not_found(&session_id),
    }
}

async fn delete_session(State(mock): State<OpenCodeMock>, Path(session_id): Path<String>) -> Response {
    let mut sessions = mock.sessions.lock().expect("sessions lock");
    let before = sessions.len();
    sessions.retain(|session| session["id"] != session_id.as_str());
    if sessions.len() == before {
        return not_found(&session_id);
    }
    mock.deleted.lock().expect("deleted lock").push(session_id);
    Json(json!(true)).into_response()
}

async fn messages(Path(session_id): Path<String>) -> Json<Value> {
    Json(json!([
        {
            "info": { "id": "msg_u", "sessionID": session_id, "role": "user" },
            "parts": [{ "type": "text", "text": "say hello" }]
        },
        {
            "info": { "id": "msg_a", "sessionID": session_id, "role": "assistant", "cost": 0.01 },
            "parts": [
                { "type": "reasoning", "text": "thinking" },
                { "type": "text", "text": "Hello from OpenCode" }
            ]
        }
    ]))
}

async fn diff(Path(session_id): Path<String>) -> String {
    if session_id == CLEAN_SESSION {
        String::new()
    } else {
        SAMPLE_DIFF.to_string()
    }
}

async fn prompt_async(
    State(mock): State<OpenCodeMock>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let text = body["parts"][0]["text"].as_str().unwrap_or_default().to_string();
    mock.prompts
        .lock()
        .expect("prompts lock")
        .push((session_id.clone(), body));
    let events = mock.events.clone();
    tokio::spawn(async move {
        let _ = events.send(json!({
            "type": "message.part.updated",
            "properties": { "part": {
                "id": "prt_1", "sessionID": session_id, "messageID": "msg_1",
                "type": "text", "text": "Hello"
            }}
        }).to_string());
        let _ = events.send(json!({
            "type": "message.part.delta",
            "properties": {
                "sessionID": session_id, "messageID": "msg_1", "partID": "prt_1",
                "field": "text", "delta": " from OpenCode"
            }
        }).to_string());
        if text != HANG_PROMPT {
            let _ = events.send(json!({
                "type": "message.updated",
                "properties": { "info": {
                    "id": "msg_1", "sessionID": session_id, "role": "assistant", "finish": "stop"
                }}
            }).to_string());
        }
    });
    StatusCode::NO_CONTENT
}

async fn abort(State(mock): State<OpenCodeMock>, Path(session_id): Path<String>) -> Json<Value> {
    mock.aborted.lock().expect("aborted lock").push(session_id);
    Json(json!(true))
}

async fn event_feed(
    State(mock): State<OpenCodeMock>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = mock.events.subscribe();
    let feed = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(data) => return Some((Ok::<_, Infallible>(Event::default().data(data)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(feed)
}

pub async fn serve_opencode(mock: OpenCodeMock) -> String {
    let app = Router::new()
        .route("/event", get(event_feed))
        .route("/session", get(list_sessions).post(create_session))
        .route(
            "/session/:id",
            get(get_session).patch(rename_session).delete(delete_session),
        )
        .route("/session/:id/message", get(messages))
        .route("/session/:id/diff", get(diff))
        .route("/session/:id/prompt_async", post(prompt_async))
        .route("/session/:id/abort", post(abort))
        .with_state(mock);
    serve(app).await
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotCall {
    pub method: String,
    pub body: Value,
}

impl BotCall {
    pub fn text(&self) -> &str {
        self.body["text"].as_str().unwrap_or_default()
    }
}

/// Bot API double that mirrors Telegram's answer to unchanged edits and
/// serves queued updates to `getUpdates`.
#[derive(Clone, Default)]
pub struct TelegramMock {
    pub calls: Arc<Mutex<Vec<BotCall>>>,
    updates: Arc<Mutex<Vec<Value>>>,
}

impl TelegramMock {
    pub fn calls(&self) -> Vec<BotCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Texts sent with `sendMessage` to one chat, oldest first.
    pub fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|call| call.method == "sendMessage" && call.body["chat_id"] == chat_id)
            .map(|call| call.text().to_string())
            .collect()
    }

    pub fn last_sent_to(&self, chat_id: i64) -> String {
        self.sent_to(chat_id).pop().unwrap_or_default()
    }

    pub fn queue_message(&self, update_id: i64, chat_id: i64, text: &str) {
        self.updates.lock().expect("updates lock").push(json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id * 10,
                "chat": { "id": chat_id, "type": "private" },
                "text": text
            }
        }));
    }

    fn record(&self, method: &str, body: Value) -> Option<String> {
        let mut calls = self.calls.lock().expect("calls lock");
        let previous = calls
            .iter()
            .rev()
            .filter(|call| call.body.get("text").is_some())
            .find(|call| call.body["chat_id"] == body["chat_id"])
            .map(|call| call.text().to_string());
        calls.push(BotCall {
            method: method.to_string(),
            body,
        });
        previous
    }
}

async fn send_message(State(mock): State<TelegramMock>, Json(body): Json<Value>) -> Response {
    if body["chat_id"] == json!(UNRESPONSIVE_CHAT) {
        std::future::pending::<()>().await;
    }
    if body["chat_id"] == json!(403) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })),
        )
            .into_response();
    }
    mock.record("sendMessage", body);
    Json(json!({ "ok": true, "result": { "message_id": PLACEHOLDER_MESSAGE_ID } })).into_response()
}

async fn edit_message_text(State(mock): State<TelegramMock>, Json(body): Json<Value>) -> Response {
    let text = body["text"].clone();
    let previous = mock.record("editMessageText", body);
    if previous.as_deref() == text.as_str() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: message is not modified: specified new message content and reply markup are exactly the same as a current content and reply markup of the message"
            })),
        )
            .into_response();
    }
    Json(json!({ "ok": true, "result": true })).into_response()
}

/// Answers at once with the queued updates at or past `offset`, or with an
/// empty batch after a short pause.
async fn get_updates(State(mock): State<TelegramMock>, Json(body): Json<Value>) -> Json<Value> {
    let offset = body["offset"].as_i64().unwrap_or_default();
    let pending: Vec<Value> = mock
        .updates
        .lock()
        .expect("updates lock")
        .iter()
        .filter(|update| update["update_id"].as_i64().unwrap_or_default() >= offset)
        .cloned()
        .collect();
    if pending.is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Json(json!({ "ok": true, "result": pending }))
}

async fn send_chat_action(State(mock): State<TelegramMock>, Json(body): Json<Value>) -> Json<Value> {
    mock.record("sendChatAction", body);
    Json(json!({ "ok": true, "result": true }))
}

async fn set_my_commands(State(mock): State<TelegramMock>, Json(body): Json<Value>) -> Json<Value> {
    mock.record("setMyCommands", body);
    Json(json!({ "ok": true, "result": true }))
}

pub async fn serve_telegram(mock: TelegramMock) -> String {
    let app = Router::new()
        .route(&format!("/bot{BOT_TOKEN}/sendMessage"), post(send_message))
        .route(&format!("/bot{BOT_TOKEN}/editMessageText"), post(edit_message_text))
        .route(&format!("/bot{BOT_TOKEN}/getUpdates"), post(get_updates))
        .route(&format!("/bot{BOT_TOKEN}/sendChatAction"), post(send_chat_action))
        .route(&format!("/bot{BOT_TOKEN}/setMyCommands"), post(set_my_commands))
        .with_state(mock);
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    format!("http://{addr}")
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
