//! Message handlers, their combinators, and the default processor.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use juggler_broker::Vars;
use juggler_wire::{CallPayload, Msg, PubPayload};

use crate::conn::{Conn, ConnError, ConnState};
use crate::writer::WriteError;

/// Handles a message sent or received on a connection.
///
/// The receive loop invokes the server's handler for every decoded request;
/// the result and pub/sub loops invoke it for every outbound RES/EVNT. A
/// custom handler is expected to call [`process_msg`] at some point so the
/// default behavior still happens.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, conn: &Arc<Conn>, msg: Msg);
}

/// Calls a list of handlers in order, each with the same message.
pub struct Chain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Chain {
        Chain { handlers }
    }
}

#[async_trait]
impl Handler for Chain {
    async fn handle(&self, conn: &Arc<Conn>, msg: Msg) {
        for h in &self.handlers {
            h.handle(conn, msg.clone()).await;
        }
    }
}

/// Recovers from panics in the wrapped handler: the panic is counted,
/// logged, and closes the connection instead of taking the task down.
pub struct PanicRecover {
    inner: Arc<dyn Handler>,
}

impl PanicRecover {
    pub fn new(inner: Arc<dyn Handler>) -> PanicRecover {
        PanicRecover { inner }
    }
}

#[async_trait]
impl Handler for PanicRecover {
    async fn handle(&self, conn: &Arc<Conn>, msg: Msg) {
        let uuid = msg.uuid();
        let typ = msg.typ();
        let fut = std::panic::AssertUnwindSafe(self.inner.handle(conn, msg));
        if let Err(panic) = fut.catch_unwind().await {
            if let Some(vars) = &conn.server().vars {
                vars.add("RecoveredPanics", 1);
            }
            let text = panic_message(panic);
            error!(
                "{}: recovered from panic {text}; serving message {uuid} {typ}",
                conn.uuid
            );
            conn.close(Some(ConnError::Panic(text)));
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Logs messages received from and sent to the client.
pub struct LogMsg;

#[async_trait]
impl Handler for LogMsg {
    async fn handle(&self, conn: &Arc<Conn>, msg: Msg) {
        let t = msg.typ();
        if t.is_read() {
            info!("{}: received message {} {t}", conn.uuid, msg.uuid());
        } else if t.is_write() {
            info!("{}: sending message {} {t}", conn.uuid, msg.uuid());
        }
    }
}

/// The default processor as a [`Handler`], for use inside chains.
pub struct ProcessMsg;

#[async_trait]
impl Handler for ProcessMsg {
    async fn handle(&self, conn: &Arc<Conn>, msg: Msg) {
        process_msg(conn, msg).await;
    }
}

/// A connection-state observer that logs connects and disconnects,
/// compatible with the server's `conn_state` field.
pub fn log_conn(c: &Conn, state: ConnState) {
    match state {
        ConnState::Connected => info!("{}: connected", c.uuid),
        ConnState::Closed => match c.close_err() {
            Some(e) => info!("{}: closing with error {e}", c.uuid),
            None => info!("{}: closing", c.uuid),
        },
        _ => {}
    }
}

/// The default message processing. Client requests go to the broker and are
/// acknowledged; server messages are written on the wire through the
/// exclusive writer.
pub async fn process_msg(conn: &Arc<Conn>, m: Msg) {
    let srv = Arc::clone(conn.server());
    let start = record_msg_metrics(&srv.vars, &m);

    dispatch(conn, m.clone()).await;

    if srv.slow_process_threshold.is_zero() {
        return;
    }
    if let (Some(start), Some(vars)) = (start, &srv.vars) {
        let elapsed = start.elapsed();
        if elapsed >= srv.slow_process_threshold {
            vars.add("SlowProcessMsg", 1);
            if m.typ().is_standard() {
                vars.add(&format!("SlowProcessMsg{}", m.typ()), 1);
            }
        }
    }
}

fn record_msg_metrics(vars: &Option<Arc<Vars>>, m: &Msg) -> Option<Instant> {
    let vars = vars.as_ref()?;
    vars.add("Msgs", 1);
    let t = m.typ();
    if t.is_read() {
        vars.add("MsgsRead", 1);
    }
    if t.is_write() {
        vars.add("MsgsWrite", 1);
    }
    if t.is_standard() {
        vars.add(&format!("Msgs{t}"), 1);
    }
    Some(Instant::now())
}

async fn dispatch(conn: &Arc<Conn>, m: Msg) {
    let srv = Arc::clone(conn.server());
    match &m {
        Msg::Call(call) => {
            let cp = CallPayload::new(
                conn.uuid,
                call.meta.uuid,
                call.payload.uri.clone(),
                call.payload.args.clone(),
            );
            let timeout = std::time::Duration::from_millis(call.payload.timeout);
            match srv.caller_broker.call(&cp, timeout).await {
                Ok(()) => conn.send(Msg::new_ack(&m)).await,
                Err(e) => conn.send(Msg::new_nack(&m, 500, Arc::new(e))).await,
            }
        }
        Msg::Pub(pub_) => {
            let pp = PubPayload {
                msg_uuid: pub_.meta.uuid,
                args: pub_.payload.args.clone(),
            };
            match srv.pubsub_broker.publish(&pub_.payload.channel, &pp).await {
                Ok(()) => conn.send(Msg::new_ack(&m)).await,
                Err(e) => conn.send(Msg::new_nack(&m, 500, Arc::new(e))).await,
            }
        }
        Msg::Sub(sub) => {
            match subscribe(conn, &sub.payload.channel, sub.payload.pattern, true).await {
                Ok(()) => conn.send(Msg::new_ack(&m)).await,
                Err(e) => conn.send(Msg::new_nack(&m, 500, e)).await,
            }
        }
        Msg::Unsb(unsb) => {
            match subscribe(conn, &unsb.payload.channel, unsb.payload.pattern, false).await {
                Ok(()) => conn.send(Msg::new_ack(&m)).await,
                Err(e) => conn.send(Msg::new_nack(&m, 500, e)).await,
            }
        }
        Msg::Ack(_) | Msg::Nack(_) | Msg::Res(_) | Msg::Evnt(_) => do_write(conn, &m).await,
    }
}

async fn subscribe(
    conn: &Arc<Conn>,
    channel: &str,
    pattern: bool,
    sub: bool,
) -> Result<(), Arc<dyn std::error::Error + Send + Sync>> {
    let Some(psc) = conn.pubsub() else {
        return Err(Arc::new(std::io::Error::other(
            "pub-sub not enabled on this connection",
        )));
    };
    let res = if sub {
        psc.subscribe(channel, pattern).await
    } else {
        psc.unsubscribe(channel, pattern).await
    };
    res.map_err(|e| Arc::new(e) as Arc<dyn std::error::Error + Send + Sync>)
}

// Write failures are classified: a lock timeout closes the connection, an
// exceeded write limit is reported back with a NACK(599), anything else
// closes.
async fn do_write(conn: &Arc<Conn>, m: &Msg) {
    let srv = Arc::clone(conn.server());
    let add = |name: &str| {
        if let Some(vars) = &srv.vars {
            vars.add(name, 1);
        }
    };

    let Err(err) = conn.write_msg(m).await else {
        return;
    };

    match &err {
        ConnError::Write(WriteError::LockTimeout) => {
            add("WriteLockTimeouts");
            conn.close(Some(err));
        }
        ConnError::Write(WriteError::LimitExceeded) => {
            add("WriteLimitExceeded");
            warn!("{}: writing message {} failed: {err}", conn.uuid, m.uuid());

            // no good code for this case
            let nack = Msg::new_nack(m, 599, Arc::new(WriteError::LimitExceeded));
            if let Err(err2) = conn.write_msg(&nack).await {
                if matches!(&err2, ConnError::Write(WriteError::LockTimeout)) {
                    add("WriteLockTimeouts");
                }
                debug!(
                    "{}: write-limit-exceeded notification for {} failed: {err2}",
                    conn.uuid,
                    m.uuid()
                );
                conn.close(Some(err2));
            }
        }
        _ => {
            warn!("{}: writing message {} failed: {err}", conn.uuid, m.uuid());
            conn.close(Some(err));
        }
    }
}
