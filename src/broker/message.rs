//! Message definitions
//!
//! `Message` is what publishers hand to the broker and what the broker
//! hands back to consumers. The body is opaque bytes; this harness always
//! fills it with a JSON `MessagePayload`.
//!
//! Notes on fields:
//! - `id`: `{runId}.{sequence}` (or `{runId}.{publisher}.{sequence}` with
//!   unique ids enabled); unique within one publisher's run only
//! - `content_type`: always `application/json` here
//! - `body`: UTF-8 JSON `{"Name": ..., "RunId": ...}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Message {
    /// Build a JSON message carrying `payload`.
    pub fn json(id: impl Into<String>, payload: &MessagePayload) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: serde_json::to_vec(payload)?,
        })
    }

    pub fn payload(&self) -> Result<MessagePayload, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Logical content of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RunId")]
    pub run_id: String,
}

/// Broker-supplied metadata for one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryMetadata {
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    pub lock_token: Uuid,
    pub enqueued_at: DateTime<Utc>,
}
