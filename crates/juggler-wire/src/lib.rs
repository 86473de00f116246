#![deny(unsafe_code)]

//! Wire-level message types for the juggler protocol.
//!
//! A juggler message is a single JSON object carried in one websocket TEXT
//! frame:
//!
//! ```json
//! {"meta": {"uuid": "…", "type": "CALL"}, "payload": {…}}
//! ```
//!
//! The eight standard types split into two classes: requests sent by
//! clients (`CALL`, `SUB`, `UNSB`, `PUB`) and responses sent by the server
//! (`ACK`, `NACK`, `RES`, `EVNT`). Decoding dispatches on `meta.type`, and
//! the filtered decoders ([`Msg::decode_request`] / [`Msg::decode_response`])
//! accept exactly one class. Additional message types can be registered at
//! startup with [`MsgType::register`]; registered types are neither requests
//! nor responses and are decoded by their owners, not by this crate.
//!
//! Besides the on-wire messages, this crate defines the payload records the
//! broker moves around ([`CallPayload`], [`ResPayload`], [`PubPayload`],
//! [`EvntPayload`]) and the write-limit helper shared by the gateway and the
//! client ([`LimitWriter`]).

use std::time::Duration;

mod msg;
mod payload;
mod types;
mod writer;

/// The protocol version negotiated as the websocket subprotocol.
pub const SUBPROTOCOL: &str = "juggler.0";

/// Timeout the broker applies when a call (or result) is submitted with a
/// zero timeout; clients assume the same value when synthesizing expiry.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub use msg::{
    Ack, AckBody, Call, CallBody, CodecError, Evnt, EvntBody, Meta, Msg, Nack, NackBody, Pub,
    PubBody, Res, ResBody, Sub, SubBody, Unsb,
};
pub use payload::{CallPayload, ErrResult, EvntPayload, PubPayload, ResPayload};
pub use types::MsgType;
pub use writer::{encode_frame, LimitWriter, WriteError};
