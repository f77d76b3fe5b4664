#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use opencode_relay_stream::{Destination, MessageHandle, MessageSink, SinkError, SinkFuture};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Create { chat_id: i64, text: String },
    Update { chat_id: i64, message_id: i64, text: String },
}

impl SinkCall {
    pub fn text(&self) -> &str {
        match self {
            Self::Create { text, .. } | Self::Update { text, .. } => text,
        }
    }
}

/// Sink that records every call and answers from configurable flags.
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    next_message_id: AtomicI64,
    pub fail_updates: AtomicBool,
    pub report_not_modified: AtomicBool,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn last_text(&self) -> Option<String> {
        self.calls().last().map(|call| call.text().to_string())
    }
}

impl MessageSink for RecordingSink {
    fn create(&self, destination: Destination, text: String) -> SinkFuture<'_, MessageHandle> {
        self.calls.lock().expect("calls lock").push(SinkCall::Create {
            chat_id: destination.chat_id,
            text,
        });
        let id = 500 + self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(MessageHandle(id)) })
    }

    fn update(
        &self,
        destination: Destination,
        handle: MessageHandle,
        text: String,
    ) -> SinkFuture<'_, ()> {
        self.calls.lock().expect("calls lock").push(SinkCall::Update {
            chat_id: destination.chat_id,
            message_id: handle.0,
            text,
        });
        let fail = self.fail_updates.load(Ordering::SeqCst);
        let not_modified = self.report_not_modified.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                Err(SinkError::Transport("connection reset".to_string()))
            } else if not_modified {
                Err(SinkError::NotModified)
            } else {
                Ok(())
            }
        })
    }
}

/// Sink whose calls never resolve, standing in for a hung chat API.
#[derive(Debug, Default)]
pub struct StalledSink {
    started: AtomicUsize,
}

impl StalledSink {
    /// Number of sink calls that have started and are still hanging.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl MessageSink for StalledSink {
    fn create(&self, _destination: Destination, _text: String) -> SinkFuture<'_, MessageHandle> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::pending::<Result<MessageHandle, SinkError>>())
    }

    fn update(
        &self,
        _destination: Destination,
        _handle: MessageHandle,
        _text: String,
    ) -> SinkFuture<'_, ()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::pending::<Result<(), SinkError>>())
    }
}

pub fn part_frame(session_id: &str, part_id: &str, kind: &str, text: &str) -> String {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": part_id,
                "sessionID": session_id,
                "messageID": "msg_1",
                "type": kind,
                "text": text,
            }
        }
    })
    .to_string()
}

pub fn delta_frame(session_id: &str, part_id: &str, field: &str, delta: &str) -> String {
    json!({
        "type": "message.part.delta",
        "properties": {
            "sessionID": session_id,
            "messageID": "msg_1",
            "partID": part_id,
            "field": field,
            "delta": delta,
        }
    })
    .to_string()
}

pub fn completed_frame(session_id: &str, finish: &str) -> String {
    json!({
        "type": "message.updated",
        "properties": {
            "info": {
                "id": "msg_1",
                "sessionID": session_id,
                "role": "assistant",
                "finish": finish,
            }
        }
    })
    .to_string()
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
