//! Per-connection state and the three connection loops.

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use juggler_broker::{BrokerError, EventsStream, PubSubCtl, ResultsStream};
use juggler_wire::{CodecError, Msg, MsgType};

use crate::handler::process_msg;
use crate::writer::{WriteError, WsWriter};
use crate::Server;

/// The possible states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unknown,
    Accepting,
    Connected,
    Closed,
}

/// The error that terminates a connection.
#[derive(Debug)]
pub enum ConnError {
    /// Decode failure or a message type outside the allowed set.
    Codec(CodecError),
    /// A frame that is not websocket TEXT.
    InvalidFrame(&'static str),
    /// No complete frame arrived within the configured read timeout.
    ReadTimeout,
    /// The frame could not be pushed within the configured write timeout.
    WriteTimeout,
    /// Exclusive-writer failure (lock timeout, write limit, encoding).
    Write(WriteError),
    /// Websocket transport failure.
    Ws(axum::Error),
    /// Broker handle setup or stream failure.
    Broker(Arc<BrokerError>),
    /// A handler panicked while serving a message.
    Panic(String),
    /// The peer closed the websocket.
    PeerClosed,
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Codec(e) => write!(f, "codec: {e}"),
            ConnError::InvalidFrame(kind) => write!(f, "invalid websocket message type: {kind}"),
            ConnError::ReadTimeout => write!(f, "read timeout"),
            ConnError::WriteTimeout => write!(f, "write timeout"),
            ConnError::Write(e) => write!(f, "write: {e}"),
            ConnError::Ws(e) => write!(f, "websocket: {e}"),
            ConnError::Broker(e) => write!(f, "broker: {e}"),
            ConnError::Panic(msg) => write!(f, "recovered from panic: {msg}"),
            ConnError::PeerClosed => write!(f, "connection closed by peer"),
        }
    }
}

impl Error for ConnError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnError::Codec(e) => Some(e),
            ConnError::Write(e) => Some(e),
            ConnError::Ws(e) => Some(e),
            ConnError::Broker(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

struct CloseState {
    closed: bool,
    err: Option<Arc<ConnError>>,
}

// The close-once latch: n closes yield one notification, and the close
// error is the first non-None value passed in.
struct CloseOnce {
    state: Mutex<CloseState>,
    tx: watch::Sender<bool>,
}

impl CloseOnce {
    fn new() -> CloseOnce {
        let (tx, _) = watch::channel(false);
        CloseOnce {
            state: Mutex::new(CloseState {
                closed: false,
                err: None,
            }),
            tx,
        }
    }

    fn close(&self, err: Option<ConnError>) {
        let mut state = self.state.lock().unwrap();
        if state.err.is_none() {
            if let Some(err) = err {
                state.err = Some(Arc::new(err));
            }
        }
        if !state.closed {
            state.closed = true;
            let _ = self.tx.send(true);
        }
    }

    fn notify(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn err(&self) -> Option<Arc<ConnError>> {
        self.state.lock().unwrap().err.clone()
    }
}

/// A juggler connection. Identified by a UUID, safe to share across tasks.
pub struct Conn {
    /// Unique identifier of the connection.
    pub uuid: Uuid,
    srv: Arc<Server>,
    allowed: Vec<MsgType>,
    writer: WsWriter,
    pubsub: OnceLock<Box<dyn PubSubCtl>>,
    close: CloseOnce,
}

impl Conn {
    pub(crate) fn new(
        uuid: Uuid,
        srv: Arc<Server>,
        sink: SplitSink<WebSocket, Message>,
        allowed: Vec<MsgType>,
    ) -> Conn {
        let writer = WsWriter::new(
            sink,
            srv.acquire_write_lock_timeout,
            srv.write_timeout,
            srv.write_limit,
        );
        Conn {
            uuid,
            srv,
            allowed,
            writer,
            pubsub: OnceLock::new(),
            close: CloseOnce::new(),
        }
    }

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.srv
    }

    /// True when the connection may send `t`.
    pub fn allows(&self, t: MsgType) -> bool {
        self.allowed.contains(&t)
    }

    pub(crate) fn allowed(&self) -> &[MsgType] {
        &self.allowed
    }

    pub(crate) fn set_pubsub(&self, ctl: Box<dyn PubSubCtl>) {
        let _ = self.pubsub.set(ctl);
    }

    pub(crate) fn pubsub(&self) -> Option<&dyn PubSubCtl> {
        self.pubsub.get().map(|b| b.as_ref())
    }

    /// Close the connection. Only the first close fires the notification;
    /// the close error is fixed at the first non-`None` value. Does not
    /// close the underlying websocket.
    pub fn close(&self, err: Option<ConnError>) {
        self.close.close(err);
    }

    /// A watch that flips to `true` once the connection is closed.
    pub fn close_notify(&self) -> watch::Receiver<bool> {
        self.close.notify()
    }

    /// The error that closed the connection. Meaningful once the close
    /// notification has fired.
    pub fn close_err(&self) -> Option<Arc<ConnError>> {
        self.close.err()
    }

    /// Write `m` on the wire through the exclusive writer.
    pub async fn write_msg(&self, m: &Msg) -> Result<(), ConnError> {
        self.writer.write_msg(m).await
    }

    /// Hand `m` to the server's handler, or to the default processor when
    /// none is set.
    pub async fn send(self: &Arc<Self>, m: Msg) {
        if let Some(h) = &self.srv.handler {
            h.handle(self, m).await;
        } else {
            // boxed: the default processor sends ACK/NACK back through here
            Box::pin(process_msg(self, m)).await;
        }
    }
}

struct GoroMetrics<'a>(&'a Server);

impl<'a> GoroMetrics<'a> {
    fn start(srv: &'a Server) -> Self {
        srv.add_var("TotalConnGoros", 1);
        srv.add_var("ActiveConnGoros", 1);
        GoroMetrics(srv)
    }
}

impl Drop for GoroMetrics<'_> {
    fn drop(&mut self) {
        self.0.add_var("ActiveConnGoros", -1);
    }
}

/// The read loop: frames in, requests dispatched, first error closes.
pub(crate) async fn receive_loop(
    conn: Arc<Conn>,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
) {
    let srv = Arc::clone(conn.server());
    let _goros = GoroMetrics::start(&srv);

    loop {
        let next = if srv.read_timeout.is_zero() {
            stream.next().await
        } else {
            match tokio::time::timeout(srv.read_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    conn.close(Some(ConnError::ReadTimeout));
                    return;
                }
            }
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                conn.close(Some(ConnError::Ws(e)));
                return;
            }
            None => {
                conn.close(Some(ConnError::PeerClosed));
                return;
            }
        };

        match frame {
            Message::Text(text) => match Msg::decode_request(text.as_str(), conn.allowed()) {
                Ok(m) => conn.send(m).await,
                Err(e) => {
                    conn.close(Some(ConnError::Codec(e)));
                    return;
                }
            },
            Message::Binary(_) => {
                conn.close(Some(ConnError::InvalidFrame("binary")));
                return;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                conn.close(Some(ConnError::PeerClosed));
                return;
            }
        }
    }
}

/// The result loop: broker results out as RES messages.
pub(crate) async fn results_loop(conn: Arc<Conn>, mut results: ResultsStream) {
    let srv = Arc::clone(conn.server());
    let _goros = GoroMetrics::start(&srv);

    let mut closed = conn.close_notify();
    if *closed.borrow() {
        conn.close(results.terminal_err().map(ConnError::Broker));
        return;
    }
    loop {
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            },
            rp = results.recv() => match rp {
                Some(rp) => conn.send(Msg::new_res(rp)).await,
                None => break,
            }
        }
    }

    // the stream stopped; close the connection if it isn't already
    conn.close(results.terminal_err().map(ConnError::Broker));
}

/// The pub/sub loop: broker events out as EVNT messages.
pub(crate) async fn events_loop(conn: Arc<Conn>, mut events: EventsStream) {
    let srv = Arc::clone(conn.server());
    let _goros = GoroMetrics::start(&srv);

    let mut closed = conn.close_notify();
    if *closed.borrow() {
        conn.close(events.terminal_err().map(ConnError::Broker));
        return;
    }
    loop {
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            },
            ep = events.recv() => match ep {
                Some(ep) => conn.send(Msg::new_evnt(ep)).await,
                None => break,
            }
        }
    }

    conn.close(events.terminal_err().map(ConnError::Broker));
}
