use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;
pub mod prefs;

/// Wire protocol version stamped into every message.
pub const API_VERSION: &str = "1";

// ============================================================================
// Core Message Types
// ============================================================================

/// Kind of telemetry message.
///
/// Stored and sent as the lowercase name (`track`, `identify`, `alias`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Track,
    Identify,
    Alias,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Track => "track",
            MessageType::Identify => "identify",
            MessageType::Alias => "alias",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "track" => Some(MessageType::Track),
            "identify" => Some(MessageType::Identify),
            "alias" => Some(MessageType::Alias),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged scalar value for event properties.
///
/// JSON-encodes as the bare value. Anything that is not a scalar (arrays,
/// objects, null) is dropped when properties are built, see
/// [`Message::filter_properties`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Int(i64),
    Double(f64),
    String(String),
    Bool(bool),
}

impl Primitive {
    /// Convert a JSON value into a `Primitive`, or `None` for unsupported
    /// types.
    pub fn from_json(value: &serde_json::Value) -> Option<Primitive> {
        match value {
            serde_json::Value::Bool(b) => Some(Primitive::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Primitive::Int(i))
                } else {
                    n.as_f64().map(Primitive::Double)
                }
            }
            serde_json::Value::String(s) => Some(Primitive::String(s.clone())),
            _ => None,
        }
    }
}

/// Operator applied to a user trait on `identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TraitOp {
    Set,
    SetOnce,
    SetOnInsert,
    Unset,
    Rename,
    CurrentDate,
    Inc,
    Mul,
    Min,
    Max,
    Add,
}

/// A single trait mutation: the operator plus its operand.
///
/// `unset` and `currentDate` carry no operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitUpdateOp {
    pub op: TraitOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl TraitUpdateOp {
    pub fn new(op: TraitOp, value: serde_json::Value) -> Self {
        Self {
            op,
            value: Some(value),
        }
    }

    pub fn bare(op: TraitOp) -> Self {
        Self { op, value: None }
    }
}

/// Environment snapshot captured when a message is created.
///
/// Sub-records are flat string maps so collectors on any platform can fill
/// them without schema coordination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageContext {
    pub app: HashMap<String, String>,
    pub device: HashMap<String, String>,
    pub os: HashMap<String, String>,
    pub locale: String,
    pub timezone: String,
    pub library: HashMap<String, String>,
    pub extra: HashMap<String, String>,
}

/// The unit of telemetry that flows through the queue.
///
/// Immutable once stored; `id` is the dedup key across the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub api_version: String,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub properties: Option<HashMap<String, Primitive>>,
    #[serde(default)]
    pub traits: Option<HashMap<String, TraitUpdateOp>>,
    pub context: MessageContext,
}

impl Message {
    /// Build a `track` message for a named event.
    ///
    /// Property values that are not scalars are dropped; if nothing survives
    /// the filter, `properties` is `None`.
    pub fn track(
        event: impl Into<String>,
        properties: &serde_json::Map<String, serde_json::Value>,
        context: MessageContext,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: MessageType::Track,
            user_id: None,
            anonymous_id: None,
            timestamp: Utc::now(),
            api_version: API_VERSION.to_string(),
            event: Some(event.into()),
            properties: Self::filter_properties(properties),
            traits: None,
            context,
        }
    }

    /// Build an `identify` message carrying trait mutations for a user.
    pub fn identify(
        user_id: impl Into<String>,
        traits: HashMap<String, TraitUpdateOp>,
        context: MessageContext,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: MessageType::Identify,
            user_id: Some(user_id.into()),
            anonymous_id: None,
            timestamp: Utc::now(),
            api_version: API_VERSION.to_string(),
            event: None,
            properties: None,
            traits: if traits.is_empty() { None } else { Some(traits) },
            context,
        }
    }

    /// Build an `alias` message tying an anonymous identity to a user id.
    pub fn alias(
        user_id: impl Into<String>,
        anonymous_id: impl Into<String>,
        context: MessageContext,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: MessageType::Alias,
            user_id: Some(user_id.into()),
            anonymous_id: Some(anonymous_id.into()),
            timestamp: Utc::now(),
            api_version: API_VERSION.to_string(),
            event: None,
            properties: None,
            traits: None,
            context,
        }
    }

    pub fn with_anonymous_id(mut self, anonymous_id: impl Into<String>) -> Self {
        self.anonymous_id = Some(anonymous_id.into());
        self
    }

    /// Keep only scalar-valued properties; empty results collapse to `None`.
    pub fn filter_properties(
        raw: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<HashMap<String, Primitive>> {
        let filtered: HashMap<String, Primitive> = raw
            .iter()
            .filter_map(|(k, v)| Primitive::from_json(v).map(|p| (k.clone(), p)))
            .collect();
        if filtered.is_empty() {
            None
        } else {
            Some(filtered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_roundtrip() {
        for (ty, name) in [
            (MessageType::Track, "track"),
            (MessageType::Identify, "identify"),
            (MessageType::Alias, "alias"),
        ] {
            assert_eq!(ty.as_str(), name);
            assert_eq!(MessageType::parse(name), Some(ty));
        }
        assert_eq!(MessageType::parse("screen"), None);
    }

    #[test]
    fn test_primitive_from_json() {
        assert_eq!(Primitive::from_json(&json!(7)), Some(Primitive::Int(7)));
        assert_eq!(
            Primitive::from_json(&json!(1.5)),
            Some(Primitive::Double(1.5))
        );
        assert_eq!(
            Primitive::from_json(&json!("x")),
            Some(Primitive::String("x".to_string()))
        );
        assert_eq!(
            Primitive::from_json(&json!(true)),
            Some(Primitive::Bool(true))
        );
        assert_eq!(Primitive::from_json(&json!(null)), None);
        assert_eq!(Primitive::from_json(&json!([1, 2])), None);
        assert_eq!(Primitive::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_filter_properties_drops_unsupported() {
        let raw = json!({
            "count": 3,
            "ratio": 0.5,
            "name": "checkout",
            "ok": false,
            "nested": {"drop": "me"},
            "items": [1, 2, 3],
        });
        let props = Message::filter_properties(raw.as_object().unwrap()).unwrap();
        assert_eq!(props.len(), 4);
        assert_eq!(props["count"], Primitive::Int(3));
        assert!(!props.contains_key("nested"));
        assert!(!props.contains_key("items"));
    }

    #[test]
    fn test_filter_properties_empty_is_none() {
        let raw = json!({"only": [1], "nested": {}});
        assert!(Message::filter_properties(raw.as_object().unwrap()).is_none());

        let empty = serde_json::Map::new();
        assert!(Message::filter_properties(&empty).is_none());
    }

    #[test]
    fn test_track_constructor() {
        let raw = json!({"plan": "pro", "seats": 4});
        let msg = Message::track(
            "subscription_started",
            raw.as_object().unwrap(),
            MessageContext::default(),
        );
        assert_eq!(msg.message_type, MessageType::Track);
        assert_eq!(msg.event.as_deref(), Some("subscription_started"));
        assert_eq!(msg.api_version, API_VERSION);
        assert_eq!(msg.properties.as_ref().unwrap().len(), 2);
        assert!(msg.traits.is_none());
    }

    #[test]
    fn test_message_serde_shape() {
        let raw = json!({"n": 1});
        let mut msg = Message::track("evt", raw.as_object().unwrap(), MessageContext::default());
        msg.anonymous_id = Some("anon-1".to_string());

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "track");
        assert_eq!(value["anonymousId"], "anon-1");
        assert_eq!(value["userId"], serde_json::Value::Null);
        assert_eq!(value["apiVersion"], "1");
        assert_eq!(value["properties"]["n"], 1);

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_trait_op_serde_names() {
        assert_eq!(
            serde_json::to_value(TraitOp::SetOnce).unwrap(),
            json!("setOnce")
        );
        assert_eq!(
            serde_json::to_value(TraitOp::CurrentDate).unwrap(),
            json!("currentDate")
        );
        assert_eq!(serde_json::to_value(TraitOp::Set).unwrap(), json!("set"));

        let op = TraitUpdateOp::bare(TraitOp::Unset);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"op": "unset"}));
    }
}
