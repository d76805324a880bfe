//! Wire payload for `POST {serverUrl}/batch`
//!
//! Field names and null handling match the ingestion API exactly: camelCase
//! keys, absent identifiers serialized as explicit nulls, timestamps in
//! ISO-8601 with millisecond precision. `sentAt` is stamped per send
//! attempt, not stored with the message.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rf_common::{Message, MessageContext, MessageType, Primitive, TraitUpdateOp};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct BatchPayload {
    pub batch: Vec<BatchItem>,
}

impl BatchPayload {
    /// Build the upload body, stamping every item with the same `sentAt`.
    pub fn new(messages: &[Message], sent_at: DateTime<Utc>) -> Self {
        Self {
            batch: messages.iter().map(|m| BatchItem::new(m, sent_at)).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub timestamp: String,
    pub api_version: String,
    pub event: Option<String>,
    pub properties: Option<HashMap<String, Primitive>>,
    pub traits: Option<HashMap<String, TraitUpdateOp>>,
    pub context: MessageContext,
    pub sent_at: String,
}

impl BatchItem {
    pub fn new(message: &Message, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: message.id.clone(),
            message_type: message.message_type,
            user_id: message.user_id.clone(),
            anonymous_id: message.anonymous_id.clone(),
            timestamp: iso8601_millis(message.timestamp),
            api_version: message.api_version.clone(),
            event: message.event.clone(),
            properties: message.properties.clone(),
            traits: message.traits.clone(),
            context: message.context.clone(),
            sent_at: iso8601_millis(sent_at),
        }
    }
}

fn iso8601_millis(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}
