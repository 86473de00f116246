//! Payload records exchanged through the broker.
//!
//! These are the store-visible shapes: a call request queued for a callee,
//! a call result queued for the originating connection, a published event,
//! and the re-framed event delivered to subscribers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A call request, queued on the per-URI list until a callee pops it or its
/// timeout key expires.
///
/// `read_at` and `ttl_after_read` never travel through the store; the
/// dequeuer stamps them when it pops the payload and reads the remaining
/// TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub conn_uuid: Uuid,
    pub msg_uuid: Uuid,
    pub uri: String,
    pub args: Value,
    #[serde(skip)]
    pub read_at: Option<Instant>,
    #[serde(skip)]
    pub ttl_after_read: Duration,
}

impl CallPayload {
    pub fn new(conn_uuid: Uuid, msg_uuid: Uuid, uri: impl Into<String>, args: Value) -> Self {
        CallPayload {
            conn_uuid,
            msg_uuid,
            uri: uri.into(),
            args,
            read_at: None,
            ttl_after_read: Duration::ZERO,
        }
    }
}

/// A call result, queued on the per-connection list until the gateway pops
/// it or its timeout key expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResPayload {
    pub conn_uuid: Uuid,
    pub msg_uuid: Uuid,
    pub uri: String,
    pub args: Value,
}

/// A published event, carried inside the store's pub/sub message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubPayload {
    pub msg_uuid: Uuid,
    pub args: Value,
}

/// An event as delivered to a subscribed connection. `pattern` is empty when
/// the subscription was a literal channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvntPayload {
    pub msg_uuid: Uuid,
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    pub args: Value,
}

/// The generic error shape a callee stores when a handler fails without
/// providing its own JSON form: `{"error": {"message": "…"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrResult {
    pub error: ErrResultBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrResultBody {
    pub message: String,
}

impl ErrResult {
    pub fn new(message: impl Into<String>) -> Self {
        ErrResult {
            error: ErrResultBody {
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_payload_skips_dequeuer_fields() {
        let cp = CallPayload {
            conn_uuid: Uuid::new_v4(),
            msg_uuid: Uuid::new_v4(),
            uri: "test.echo".into(),
            args: serde_json::json!({"x": 3}),
            read_at: Some(Instant::now()),
            ttl_after_read: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&cp).unwrap();
        assert!(!json.contains("read_at"));
        assert!(!json.contains("ttl_after_read"));

        let back: CallPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.read_at, None);
        assert_eq!(back.ttl_after_read, Duration::ZERO);
        assert_eq!(back.uri, cp.uri);
        assert_eq!(back.args, cp.args);
    }

    #[test]
    fn evnt_payload_pattern_omitted_when_literal() {
        let ep = EvntPayload {
            msg_uuid: Uuid::new_v4(),
            channel: "c".into(),
            pattern: String::new(),
            args: Value::Null,
        };
        let json = serde_json::to_string(&ep).unwrap();
        assert!(!json.contains("pattern"));

        let back: EvntPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pattern, "");
    }

    #[test]
    fn err_result_shape() {
        let er = ErrResult::new("boom");
        let json = serde_json::to_value(&er).unwrap();
        assert_eq!(json, serde_json::json!({"error": {"message": "boom"}}));
    }
}
