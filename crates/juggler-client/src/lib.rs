#![deny(unsafe_code)]

//! A juggler client.
//!
//! A [`Client`] wraps a websocket connection to a juggler server. It makes
//! RPC calls identified by a URI, subscribes to and unsubscribes from
//! pub/sub channels, and publishes events.
//!
//! Received replies and events are handed to a [`Handler`], each in its own
//! task. An RPC call that was acknowledged by the server produces exactly
//! one of RES or [`Exp`], never both: when no result arrived before the
//! call timeout, the client synthesizes a local [`Exp`] message (a custom
//! message type that never travels on the wire), and a RES arriving after
//! that is dropped.

mod exp;

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use uuid::Uuid;

use juggler_wire::{
    encode_frame, Call, CodecError, Msg, MsgType, WriteError, DEFAULT_CALL_TIMEOUT, SUBPROTOCOL,
};

pub use exp::{Exp, ExpBody, EXP_MSG};

/// Request header restricting the messages this connection will send; the
/// server closes the connection on any other type.
pub const ALLOWED_MESSAGES_HEADER: &str = "juggler-allowed-messages";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A message delivered to the client's [`Handler`]: either a server
/// response, or the locally synthesized [`Exp`].
#[derive(Debug, Clone)]
pub enum Incoming {
    Msg(Msg),
    Exp(Exp),
}

/// Handles messages received from the server (and synthesized expirations).
/// Each invocation runs in its own task; shared state needs its own
/// synchronization.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, msg: Incoming);
}

/// Client failure.
#[derive(Debug)]
pub enum ClientError {
    /// Request serialization failed.
    Codec(CodecError),
    /// Exclusive-writer failure (lock timeout, write limit, encoding).
    Write(WriteError),
    /// The frame could not be pushed within the configured write timeout.
    WriteTimeout,
    /// Websocket failure.
    Ws(tokio_tungstenite::tungstenite::Error),
    /// Invalid dial parameters.
    Config(String),
    /// The connection is closed.
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Codec(e) => write!(f, "codec: {e}"),
            ClientError::Write(e) => write!(f, "write: {e}"),
            ClientError::WriteTimeout => write!(f, "write timeout"),
            ClientError::Ws(e) => write!(f, "websocket: {e}"),
            ClientError::Config(msg) => write!(f, "{msg}"),
            ClientError::Closed => write!(f, "closed connection"),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Codec(e) => Some(e),
            ClientError::Write(e) => Some(e),
            ClientError::Ws(e) => Some(e),
            _ => None,
        }
    }
}

/// Client options. The zero values defer to the connection defaults: no
/// write deadline, no write limit, wait forever for the write lock, and the
/// standard call timeout.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Time to wait for a call result before synthesizing an expiration;
    /// zero means [`DEFAULT_CALL_TIMEOUT`]. Per-call timeouts take
    /// precedence.
    pub call_timeout: Duration,
    pub write_timeout: Duration,
    pub acquire_write_lock_timeout: Duration,
    pub write_limit: usize,
}

/// A juggler client over a websocket connection.
pub struct Client {
    sink: Arc<tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>>,
    opts: Options,
    handler: Arc<dyn Handler>,
    pending: Arc<Mutex<HashSet<Uuid>>>,
    err: Arc<Mutex<Option<Arc<ClientError>>>>,
    closed: watch::Receiver<bool>,
}

impl Client {
    /// Create a client over an established websocket connection and start
    /// its read loop.
    pub fn new(ws: WsStream, handler: Arc<dyn Handler>, opts: Options) -> Client {
        // force the EXP type registration before any message can expire
        let _ = *EXP_MSG;

        let (sink, stream) = ws.split();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let err = Arc::new(Mutex::new(None));
        let (closed_tx, closed) = watch::channel(false);

        tokio::spawn(read_loop(
            stream,
            Arc::clone(&pending),
            Arc::clone(&err),
            Arc::clone(&handler),
            closed_tx,
        ));

        Client {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            opts,
            handler,
            pending,
            err,
            closed,
        }
    }

    /// Dial `url` with the `juggler.0` subprotocol and create a client.
    /// When `allowed_messages` is set, it is sent as the
    /// `Juggler-Allowed-Messages` header.
    pub async fn dial(
        url: &str,
        allowed_messages: Option<&str>,
        handler: Arc<dyn Handler>,
        opts: Options,
    ) -> Result<Client, ClientError> {
        let mut req = url.into_client_request().map_err(ClientError::Ws)?;
        req.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );
        if let Some(allowed) = allowed_messages {
            let value = HeaderValue::from_str(allowed)
                .map_err(|e| ClientError::Config(format!("invalid allowed-messages header: {e}")))?;
            req.headers_mut().insert(ALLOWED_MESSAGES_HEADER, value);
        }
        let (ws, _resp) = connect_async(req).await.map_err(ClientError::Ws)?;
        Ok(Client::new(ws, handler, opts))
    }

    /// The latched failure, if any. Once set, requests are refused with it.
    pub fn err(&self) -> Option<Arc<ClientError>> {
        self.err.lock().unwrap().clone()
    }

    /// A watch that flips to `true` once the read loop has stopped.
    pub fn close_notify(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Close the connection and wait for the read loop to stop. Returns the
    /// failure that closed the client, if any came first.
    pub async fn close(&self) -> Option<Arc<ClientError>> {
        {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        }
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;

        let mut err = self.err.lock().unwrap();
        if err.is_none() {
            *err = Some(Arc::new(ClientError::Closed));
        }
        err.clone()
    }

    /// Make a call request for the remote procedure identified by `uri`,
    /// with `args` marshaled as JSON. A `timeout` of zero uses the client's
    /// call timeout. Returns the call message's UUID; the result (RES) or
    /// expiration ([`Exp`]) arrives through the handler.
    pub async fn call(
        &self,
        uri: &str,
        args: impl Serialize,
        timeout: Duration,
    ) -> Result<Uuid, Arc<ClientError>> {
        if let Some(e) = self.err() {
            return Err(e);
        }

        let timeout = if timeout.is_zero() {
            self.opts.call_timeout
        } else {
            timeout
        };
        let call = Call::new(uri, args, timeout).map_err(|e| Arc::new(ClientError::Codec(e)))?;
        self.do_write(&Msg::Call(call.clone())).await?;

        let uuid = call.meta.uuid;
        self.pending.lock().unwrap().insert(uuid);

        tokio::spawn(expire_call(
            call,
            timeout,
            Arc::clone(&self.pending),
            Arc::clone(&self.handler),
            self.closed.clone(),
        ));
        Ok(uuid)
    }

    /// Subscribe to `channel`, treated as a pattern when `pattern` is true.
    pub async fn sub(&self, channel: &str, pattern: bool) -> Result<Uuid, Arc<ClientError>> {
        if let Some(e) = self.err() {
            return Err(e);
        }
        let m = Msg::new_sub(channel, pattern);
        self.do_write(&m).await?;
        Ok(m.uuid())
    }

    /// Unsubscribe from `channel`, treated as a pattern when `pattern` is
    /// true.
    pub async fn unsb(&self, channel: &str, pattern: bool) -> Result<Uuid, Arc<ClientError>> {
        if let Some(e) = self.err() {
            return Err(e);
        }
        let m = Msg::new_unsb(channel, pattern);
        self.do_write(&m).await?;
        Ok(m.uuid())
    }

    /// Publish `args` on `channel`.
    pub async fn pub_(
        &self,
        channel: &str,
        args: impl Serialize,
    ) -> Result<Uuid, Arc<ClientError>> {
        if let Some(e) = self.err() {
            return Err(e);
        }
        let m = Msg::new_pub(channel, args).map_err(|e| Arc::new(ClientError::Codec(e)))?;
        self.do_write(&m).await?;
        Ok(m.uuid())
    }

    // write through the exclusive writer, latching fatal write failures
    async fn do_write(&self, m: &Msg) -> Result<(), Arc<ClientError>> {
        match self.write_msg(m).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = Arc::new(e);
                if matches!(
                    *e,
                    ClientError::Write(WriteError::LockTimeout)
                        | ClientError::Write(WriteError::LimitExceeded)
                ) {
                    let mut err = self.err.lock().unwrap();
                    if err.is_none() {
                        *err = Some(Arc::clone(&e));
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_msg(&self, m: &Msg) -> Result<(), ClientError> {
        let mut sink = if self.opts.acquire_write_lock_timeout.is_zero() {
            self.sink.lock().await
        } else {
            tokio::time::timeout(self.opts.acquire_write_lock_timeout, self.sink.lock())
                .await
                .map_err(|_| ClientError::Write(WriteError::LockTimeout))?
        };

        let frame = encode_frame(m, self.opts.write_limit).map_err(ClientError::Write)?;

        let send = sink.send(WsMessage::Text(frame.into()));
        if self.opts.write_timeout.is_zero() {
            send.await.map_err(ClientError::Ws)?;
        } else {
            tokio::time::timeout(self.opts.write_timeout, send)
                .await
                .map_err(|_| ClientError::WriteTimeout)?
                .map_err(ClientError::Ws)?;
        }
        Ok(())
    }
}

fn delete_pending(pending: &Mutex<HashSet<Uuid>>, uuid: Uuid) -> bool {
    pending.lock().unwrap().remove(&uuid)
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: Arc<Mutex<HashSet<Uuid>>>,
    err: Arc<Mutex<Option<Arc<ClientError>>>>,
    handler: Arc<dyn Handler>,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let mut err = err.lock().unwrap();
                if err.is_none() {
                    *err = Some(Arc::new(ClientError::Ws(e)));
                }
                break;
            }
            None => break,
        };

        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let m = match Msg::decode_response(text.as_str()) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping undecodable message: {e}");
                continue;
            }
        };

        match &m {
            Msg::Res(res) => {
                // when the expiration got there first, the call was already
                // treated as expired and the result is dropped
                if !delete_pending(&pending, res.payload.for_) {
                    continue;
                }
            }
            Msg::Nack(nack) if nack.payload.for_type == MsgType::CALL => {
                // no result will come for this call
                delete_pending(&pending, nack.payload.for_);
            }
            _ => {}
        }

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler.handle(Incoming::Msg(m)).await;
        });
    }

    let _ = closed_tx.send(true);
}

async fn expire_call(
    call: Call,
    timeout: Duration,
    pending: Arc<Mutex<HashSet<Uuid>>>,
    handler: Arc<dyn Handler>,
    mut closed: watch::Receiver<bool>,
) {
    let timeout = if timeout.is_zero() {
        DEFAULT_CALL_TIMEOUT
    } else {
        timeout
    };

    tokio::select! {
        _ = closed.wait_for(|c| *c) => return,
        _ = tokio::time::sleep(timeout) => {}
    }

    // still pending means no RES and no NACK: synthesize the expiration
    if delete_pending(&pending, call.meta.uuid) {
        let exp = Exp::new(&call);
        tokio::spawn(async move {
            handler.handle(Incoming::Exp(exp)).await;
        });
    }
}
