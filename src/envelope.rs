//! Message envelope seam: turns buffered stream text into wire frames.

use crate::wire::Frame;
use serde::Serialize;
use serde_json::{json, Value};

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
const PROTOCOL_VERSION: &str = "5.3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamContent {
    pub name: String,
    pub text: String,
}

pub trait Envelope: Send + Sync + 'static {
    /// Build a ready-to-send `stream` message addressed to `topic`.
    fn stream_message(&self, parent: &Value, topic: &[u8], content: &StreamContent) -> Vec<Frame>;
}

/// Pull the header out of a parent message, or take the value as a header if
/// it has none.
pub fn extract_header(parent: &Value) -> Value {
    match parent.get("header") {
        Some(header) => header.clone(),
        None if parent.is_object() => parent.clone(),
        None => json!({}),
    }
}

/// Unsigned JSON envelope in the usual multipart layout:
/// `[topic, <IDS|MSG>, signature, header, parent_header, metadata, content]`.
#[derive(Debug, Clone)]
pub struct JsonEnvelope {
    session: String,
    username: String,
}

impl JsonEnvelope {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            username: username.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn header(&self, msg_type: &str) -> Value {
        json!({
            "msg_id": uuid::Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "session": self.session,
            "username": self.username,
            "date": chrono::Utc::now().to_rfc3339(),
            "version": PROTOCOL_VERSION,
        })
    }
}

impl Default for JsonEnvelope {
    fn default() -> Self {
        Self::new("iopub")
    }
}

impl Envelope for JsonEnvelope {
    fn stream_message(&self, parent: &Value, topic: &[u8], content: &StreamContent) -> Vec<Frame> {
        let content = serde_json::to_vec(content).unwrap_or_else(|_| b"{}".to_vec());
        vec![
            topic.to_vec(),
            DELIMITER.to_vec(),
            Vec::new(),
            self.header("stream").to_string().into_bytes(),
            parent.to_string().into_bytes(),
            b"{}".to_vec(),
            content,
        ]
    }
}

#[cfg(test)]
#[path = "../tests/unit/envelope.rs"]
mod tests;
