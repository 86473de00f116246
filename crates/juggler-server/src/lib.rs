#![deny(unsafe_code)]

//! The juggler gateway server.
//!
//! Clients open a websocket negotiated on a supported subprotocol
//! ([`SUBPROTOCOLS`]) and exchange juggler messages with the gateway, which
//! fronts a broker: CALL requests are queued for callee workers, their
//! results flow back through a per-connection result queue, and
//! SUB/UNSB/PUB ride the broker's pub/sub primitives.
//!
//! A [`Server`] carries the per-connection policy (limits, timeouts, allowed
//! messages, handler chain) and the two broker halves. [`router`] mounts the
//! websocket upgrade endpoint and the JSON metrics endpoint on an axum
//! router; [`Server::serve_conn`] drives one accepted socket until the
//! juggler connection closes.
//!
//! An HTTP request header `Juggler-Allowed-Messages` with a comma-separated
//! subset of `call, sub, unsb, pub` restricts what the connection may send;
//! `*` or absence allows everything. Restricted connections skip the broker
//! handles they cannot use.

mod conn;
mod handler;
mod router;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use tracing::debug;
use uuid::Uuid;

use juggler_broker::{CallerBroker, PubSubBroker, Vars};
use juggler_wire::MsgType;

pub use conn::{Conn, ConnError, ConnState};
pub use handler::{log_conn, process_msg, Chain, Handler, LogMsg, PanicRecover, ProcessMsg};
pub use router::{parse_allowed_messages, router, router_with_paths, ALLOWED_MESSAGES_HEADER};
pub use writer::WriteError;

/// Subprotocols supported by this gateway, to be advertised during the
/// websocket handshake.
pub static SUBPROTOCOLS: &[&str] = &[juggler_wire::SUBPROTOCOL];

/// Callback invoked on connection state transitions.
pub type ConnStateFn = Arc<dyn Fn(&Conn, ConnState) + Send + Sync>;

const ALL_REQUEST_MSGS: [MsgType; 4] = [MsgType::CALL, MsgType::SUB, MsgType::UNSB, MsgType::PUB];

/// A juggler gateway server. Fields may be adjusted freely before the first
/// connection is served.
pub struct Server {
    /// Maximum size in bytes of incoming messages; 0 means no limit.
    pub read_limit: usize,
    /// Maximum time to wait for the next complete frame once connected;
    /// zero waits forever.
    pub read_timeout: Duration,
    /// Maximum size in bytes of outgoing messages; 0 means no limit.
    pub write_limit: usize,
    /// Deadline for pushing a frame into the socket; zero means none.
    pub write_timeout: Duration,
    /// Time to wait for the exclusive write lock; zero waits forever.
    pub acquire_write_lock_timeout: Duration,
    /// Accept connections that negotiated no subprotocol at all.
    pub allow_empty_subprotocol: bool,
    /// Observer for connection state transitions.
    pub conn_state: Option<ConnStateFn>,
    /// Message handler; [`process_msg`] is used when unset. A custom
    /// handler is expected to call [`process_msg`] at some point, or
    /// otherwise fully process the messages itself.
    pub handler: Option<Arc<dyn Handler>>,
    /// Broker for pub/sub messages.
    pub pubsub_broker: Arc<dyn PubSubBroker>,
    /// Broker for caller messages.
    pub caller_broker: Arc<dyn CallerBroker>,
    /// Process metrics; shared with the broker when set.
    pub vars: Option<Arc<Vars>>,
    /// Processing longer than this is counted as slow; zero disables the
    /// slow-process metrics.
    pub slow_process_threshold: Duration,
}

impl Server {
    pub fn new(pubsub_broker: Arc<dyn PubSubBroker>, caller_broker: Arc<dyn CallerBroker>) -> Self {
        Server {
            read_limit: 0,
            read_timeout: Duration::ZERO,
            write_limit: 0,
            write_timeout: Duration::ZERO,
            acquire_write_lock_timeout: Duration::ZERO,
            allow_empty_subprotocol: false,
            conn_state: None,
            handler: None,
            pubsub_broker,
            caller_broker,
            vars: None,
            slow_process_threshold: Duration::from_millis(50),
        }
    }

    fn notify(&self, conn: &Conn, state: ConnState) {
        if let Some(cb) = &self.conn_state {
            cb(conn, state);
        }
    }

    fn add_var(&self, name: &str, delta: i64) {
        if let Some(vars) = &self.vars {
            vars.add(name, delta);
        }
    }

    /// Serve one accepted websocket as a juggler connection, blocking until
    /// the juggler connection closes. The underlying socket is left to the
    /// caller. When `allowed` is empty, all request messages are allowed.
    pub async fn serve_conn(self: Arc<Self>, socket: WebSocket, allowed: Vec<MsgType>) {
        self.add_var("ActiveConns", 1);
        self.add_var("TotalConns", 1);

        let allowed = if allowed.is_empty() {
            ALL_REQUEST_MSGS.to_vec()
        } else {
            allowed
        };
        let (sink, stream) = socket.split();
        let conn = Arc::new(Conn::new(Uuid::new_v4(), Arc::clone(&self), sink, allowed));

        self.notify(&conn, ConnState::Accepting);

        let call_ok = conn.allows(MsgType::CALL);
        let sub_ok = conn.allows(MsgType::SUB);
        let unsb_ok = conn.allows(MsgType::UNSB);

        // dedicated result-dequeue handle, only when CALL is allowed
        let results = if call_ok {
            match self.caller_broker.results_conn(conn.uuid).await {
                Ok(results) => Some(results),
                Err(e) => {
                    debug!("{}: failed to create results connection: {e}", conn.uuid);
                    conn.close(Some(ConnError::Broker(Arc::new(e))));
                    self.notify(&conn, ConnState::Closed);
                    self.add_var("ActiveConns", -1);
                    return;
                }
            }
        } else {
            None
        };

        // dedicated pub-sub handle, only when SUB or UNSB is allowed
        let events = if sub_ok || unsb_ok {
            match self.pubsub_broker.pubsub_conn().await {
                Ok(session) => {
                    conn.set_pubsub(session.ctl);
                    Some(session.events)
                }
                Err(e) => {
                    debug!("{}: failed to create pubsub connection: {e}", conn.uuid);
                    conn.close(Some(ConnError::Broker(Arc::new(e))));
                    self.notify(&conn, ConnState::Closed);
                    self.add_var("ActiveConns", -1);
                    return;
                }
            }
        } else {
            None
        };

        self.notify(&conn, ConnState::Connected);

        if sub_ok {
            // events can only arrive on connections that may subscribe
            if let Some(events) = events {
                tokio::spawn(conn::events_loop(Arc::clone(&conn), events));
            }
        }
        if let Some(results) = results {
            tokio::spawn(conn::results_loop(Arc::clone(&conn), results));
        }
        tokio::spawn(conn::receive_loop(Arc::clone(&conn), stream));

        // wait_for sees a close that fired during setup as well
        let mut closed = conn.close_notify();
        let _ = closed.wait_for(|c| *c).await;

        self.notify(&conn, ConnState::Closed);
        self.add_var("ActiveConns", -1);
    }
}
