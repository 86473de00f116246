//! The eight standard messages, their constructors and the JSON codec.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::payload::{EvntPayload, ResPayload};
use crate::types::MsgType;

/// The common message header: a per-message unique identifier and the type
/// tag, serialized as `{"uuid": "…", "type": "CALL"}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub typ: MsgType,
}

impl Meta {
    /// New header for `typ` with a fresh random identifier.
    pub fn new(typ: MsgType) -> Meta {
        Meta {
            uuid: Uuid::new_v4(),
            typ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub meta: Meta,
    pub payload: CallBody,
}

impl Call {
    /// Build a CALL for `uri` with `args` marshaled as opaque JSON.
    pub fn new(
        uri: impl Into<String>,
        args: impl Serialize,
        timeout: Duration,
    ) -> Result<Call, CodecError> {
        Ok(Call {
            meta: Meta::new(MsgType::CALL),
            payload: CallBody {
                uri: uri.into(),
                timeout: timeout.as_millis() as u64,
                args: serde_json::to_value(args)?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallBody {
    pub uri: String,
    /// Call timeout in milliseconds; 0 defers to the broker default.
    pub timeout: u64,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sub {
    pub meta: Meta,
    pub payload: SubBody,
}

/// Shared by SUB and UNSB: a channel name, treated as a pattern when
/// `pattern` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBody {
    pub channel: String,
    pub pattern: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsb {
    pub meta: Meta,
    pub payload: SubBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pub {
    pub meta: Meta,
    pub payload: PubBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubBody {
    pub channel: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub meta: Meta,
    pub payload: AckBody,
}

/// Acknowledges that the request identified by `for_` was accepted for
/// processing. Whichever of `uri`/`channel` the request defined is copied
/// forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckBody {
    #[serde(rename = "for")]
    pub for_: Uuid,
    #[serde(rename = "fortype")]
    pub for_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nack {
    pub meta: Meta,
    pub payload: NackBody,
}

/// Rejects the request identified by `for_`. The source error stays in
/// memory only; the wire carries its rendered text under `msg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackBody {
    #[serde(rename = "for")]
    pub for_: Uuid,
    #[serde(rename = "fortype")]
    pub for_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub code: i32,
    pub msg: String,
    #[serde(skip)]
    pub err: Option<Arc<dyn Error + Send + Sync>>,
}

impl PartialEq for NackBody {
    // the in-memory error is not part of the wire identity
    fn eq(&self, other: &Self) -> bool {
        self.for_ == other.for_
            && self.for_type == other.for_type
            && self.uri == other.uri
            && self.channel == other.channel
            && self.code == other.code
            && self.msg == other.msg
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Res {
    pub meta: Meta,
    pub payload: ResBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResBody {
    #[serde(rename = "for")]
    pub for_: Uuid,
    pub uri: String,
    pub conn_uuid: Uuid,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evnt {
    pub meta: Meta,
    pub payload: EvntBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvntBody {
    #[serde(rename = "for")]
    pub for_: Uuid,
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    pub args: Value,
}

/// A standard juggler message.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Call(Call),
    Sub(Sub),
    Unsb(Unsb),
    Pub(Pub),
    Ack(Ack),
    Nack(Nack),
    Res(Res),
    Evnt(Evnt),
}

/// Codec failure.
#[derive(Debug)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
    /// The decoded type is known but not acceptable in this position, e.g.
    /// a response where a request is expected or a type outside the
    /// connection's allowed set.
    UnexpectedType(MsgType),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "json: {e}"),
            CodecError::UnexpectedType(t) => write!(f, "unexpected message type: {t}"),
        }
    }
}

impl Error for CodecError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CodecError::Json(e) => Some(e),
            CodecError::UnexpectedType(_) => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

#[derive(Deserialize)]
struct PartialMsg {
    meta: Meta,
}

impl Msg {
    /// Build a CALL for `uri` with `args` marshaled as opaque JSON.
    pub fn new_call(
        uri: impl Into<String>,
        args: impl Serialize,
        timeout: Duration,
    ) -> Result<Msg, CodecError> {
        Ok(Msg::Call(Call::new(uri, args, timeout)?))
    }

    pub fn new_sub(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg::Sub(Sub {
            meta: Meta::new(MsgType::SUB),
            payload: SubBody {
                channel: channel.into(),
                pattern,
            },
        })
    }

    pub fn new_unsb(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg::Unsb(Unsb {
            meta: Meta::new(MsgType::UNSB),
            payload: SubBody {
                channel: channel.into(),
                pattern,
            },
        })
    }

    pub fn new_pub(channel: impl Into<String>, args: impl Serialize) -> Result<Msg, CodecError> {
        Ok(Msg::Pub(Pub {
            meta: Meta::new(MsgType::PUB),
            payload: PubBody {
                channel: channel.into(),
                args: serde_json::to_value(args)?,
            },
        }))
    }

    /// Build an ACK for the request `m`, copying its id, type and whichever
    /// of uri/channel it defines.
    pub fn new_ack(m: &Msg) -> Msg {
        let (for_, for_type, uri, channel) = forward_fields(m);
        Msg::Ack(Ack {
            meta: Meta::new(MsgType::ACK),
            payload: AckBody {
                for_,
                for_type,
                uri,
                channel,
            },
        })
    }

    /// Build a NACK for `m`, which may be a request or an ACK (so that a
    /// write failure after acknowledgement still yields a meaningful NACK).
    pub fn new_nack(m: &Msg, code: i32, err: Arc<dyn Error + Send + Sync>) -> Msg {
        let (for_, for_type, uri, channel) = forward_fields(m);
        Msg::Nack(Nack {
            meta: Meta::new(MsgType::NACK),
            payload: NackBody {
                for_,
                for_type,
                uri,
                channel,
                code,
                msg: err.to_string(),
                err: Some(err),
            },
        })
    }

    pub fn new_res(rp: ResPayload) -> Msg {
        Msg::Res(Res {
            meta: Meta::new(MsgType::RES),
            payload: ResBody {
                for_: rp.msg_uuid,
                uri: rp.uri,
                conn_uuid: rp.conn_uuid,
                args: rp.args,
            },
        })
    }

    pub fn new_evnt(ep: EvntPayload) -> Msg {
        Msg::Evnt(Evnt {
            meta: Meta::new(MsgType::EVNT),
            payload: EvntBody {
                for_: ep.msg_uuid,
                channel: ep.channel,
                pattern: ep.pattern,
                args: ep.args,
            },
        })
    }

    pub fn meta(&self) -> &Meta {
        match self {
            Msg::Call(m) => &m.meta,
            Msg::Sub(m) => &m.meta,
            Msg::Unsb(m) => &m.meta,
            Msg::Pub(m) => &m.meta,
            Msg::Ack(m) => &m.meta,
            Msg::Nack(m) => &m.meta,
            Msg::Res(m) => &m.meta,
            Msg::Evnt(m) => &m.meta,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.meta().uuid
    }

    pub fn typ(&self) -> MsgType {
        self.meta().typ
    }

    /// Serialize to the single-frame JSON form.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode any standard message, dispatching on `meta.type`.
    pub fn decode(data: &str) -> Result<Msg, CodecError> {
        let partial: PartialMsg = serde_json::from_str(data)?;
        match partial.meta.typ {
            MsgType::CALL => Ok(Msg::Call(serde_json::from_str(data)?)),
            MsgType::SUB => Ok(Msg::Sub(serde_json::from_str(data)?)),
            MsgType::UNSB => Ok(Msg::Unsb(serde_json::from_str(data)?)),
            MsgType::PUB => Ok(Msg::Pub(serde_json::from_str(data)?)),
            MsgType::ACK => Ok(Msg::Ack(serde_json::from_str(data)?)),
            MsgType::NACK => Ok(Msg::Nack(serde_json::from_str(data)?)),
            MsgType::RES => Ok(Msg::Res(serde_json::from_str(data)?)),
            MsgType::EVNT => Ok(Msg::Evnt(serde_json::from_str(data)?)),
            t => Err(CodecError::UnexpectedType(t)),
        }
    }

    /// Decode a request message. Rejects response types, and when `allowed`
    /// is non-empty, any request type outside it.
    pub fn decode_request(data: &str, allowed: &[MsgType]) -> Result<Msg, CodecError> {
        let m = Msg::decode(data)?;
        let t = m.typ();
        if !t.is_read() || (!allowed.is_empty() && !allowed.contains(&t)) {
            return Err(CodecError::UnexpectedType(t));
        }
        Ok(m)
    }

    /// Decode a response message. Rejects request types.
    pub fn decode_response(data: &str) -> Result<Msg, CodecError> {
        let m = Msg::decode(data)?;
        if !m.typ().is_write() {
            return Err(CodecError::UnexpectedType(m.typ()));
        }
        Ok(m)
    }
}

impl Serialize for Msg {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Msg::Call(m) => m.serialize(serializer),
            Msg::Sub(m) => m.serialize(serializer),
            Msg::Unsb(m) => m.serialize(serializer),
            Msg::Pub(m) => m.serialize(serializer),
            Msg::Ack(m) => m.serialize(serializer),
            Msg::Nack(m) => m.serialize(serializer),
            Msg::Res(m) => m.serialize(serializer),
            Msg::Evnt(m) => m.serialize(serializer),
        }
    }
}

// The id, type and uri/channel a response copies forward from the message
// it answers. For an ACK the already-forwarded fields are copied again so a
// NACK built from an ACK keeps pointing at the original request.
fn forward_fields(m: &Msg) -> (Uuid, MsgType, Option<String>, Option<String>) {
    match m {
        Msg::Call(c) => (c.meta.uuid, MsgType::CALL, Some(c.payload.uri.clone()), None),
        Msg::Sub(s) => (s.meta.uuid, MsgType::SUB, None, Some(s.payload.channel.clone())),
        Msg::Unsb(u) => (u.meta.uuid, MsgType::UNSB, None, Some(u.payload.channel.clone())),
        Msg::Pub(p) => (p.meta.uuid, MsgType::PUB, None, Some(p.payload.channel.clone())),
        Msg::Ack(a) => (
            a.payload.for_,
            a.payload.for_type,
            a.payload.uri.clone(),
            a.payload.channel.clone(),
        ),
        other => (other.uuid(), other.typ(), None, None),
    }
}
