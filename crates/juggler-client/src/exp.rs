//! The expired-call message.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use juggler_wire::{Call, Meta, MsgType};

/// The message type of the call expiration message, registered as a custom
/// type: it is neither a request nor a response, and never travels on the
/// wire.
pub static EXP_MSG: Lazy<MsgType> = Lazy::new(|| MsgType::register("EXP"));

/// An expired call. Raised by the client for itself when the timeout for a
/// call result has elapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exp {
    pub meta: Meta,
    pub payload: ExpBody,
}

/// No `for_type` here: an expiration always refers to a CALL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpBody {
    #[serde(rename = "for")]
    pub for_: Uuid,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    pub args: Value,
}

impl Exp {
    /// New expiration for the given call.
    pub fn new(call: &Call) -> Exp {
        Exp {
            meta: Meta::new(*EXP_MSG),
            payload: ExpBody {
                for_: call.meta.uuid,
                uri: call.payload.uri.clone(),
                args: call.payload.args.clone(),
            },
        }
    }
}
