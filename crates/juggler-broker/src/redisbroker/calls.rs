//! Dequeue loop for call requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use juggler_wire::CallPayload;

use crate::{BrokerError, CallsStream, Vars};

use super::pool::PoolConn;
use super::{call_key, call_timeout_key, del_pttl};

/// Start the dequeue loop over the call queues of `uris` and return its
/// stream. `conn` blocks on `BRPOP`; the expiry script runs on
/// `script_conn` so the pop can resume immediately while deliveries
/// complete in their own tasks.
pub(super) fn start(
    mut conn: PoolConn,
    script_conn: PoolConn,
    uris: Vec<String>,
    blocking_timeout: Duration,
    vars: Option<Arc<Vars>>,
) -> CallsStream {
    let (stream, mut feeder) = CallsStream::pair(1);

    tokio::spawn(async move {
        let keys: Vec<String> = uris.iter().map(|u| call_key(u)).collect();
        let secs = blocking_timeout.as_secs();

        loop {
            tokio::select! {
                _ = feeder.stopped() => break,
                popped = brpop(&mut conn, &keys, secs) => match popped {
                    // no value before the blocking timeout, pop again
                    Ok(None) => continue,
                    Ok(Some((_key, payload))) => {
                        let tx = feeder.tx.clone();
                        let script_conn = script_conn.clone();
                        let vars = vars.clone();
                        tokio::spawn(deliver(script_conn, payload, tx, vars));
                    }
                    Err(e) => {
                        feeder.fail(BrokerError::Redis(e));
                        break;
                    }
                }
            }
        }
        // dropping the feeder closes the stream once in-flight deliveries
        // have drained
    });

    stream
}

pub(super) async fn brpop(
    conn: &mut PoolConn,
    keys: &[String],
    secs: u64,
) -> Result<Option<(String, String)>, redis::RedisError> {
    redis::cmd("BRPOP").arg(keys).arg(secs).query_async(conn).await
}

async fn deliver(
    mut script_conn: PoolConn,
    payload: String,
    tx: mpsc::Sender<CallPayload>,
    vars: Option<Arc<Vars>>,
) {
    let add = |name: &str| {
        if let Some(v) = &vars {
            v.add(name, 1);
        }
    };

    let mut cp: CallPayload = match serde_json::from_str(&payload) {
        Ok(cp) => cp,
        Err(e) => {
            add("FailedCallPayloadUnmarshals");
            warn!("calls: failed to unmarshal call payload: {e}");
            return;
        }
    };

    let key = call_timeout_key(&cp.uri, cp.msg_uuid);
    let pttl = match del_pttl(&mut script_conn, &key).await {
        Ok(pttl) => pttl,
        Err(e) => {
            add("FailedPTTLCalls");
            warn!("calls: DEL/PTTL failed: {e}");
            return;
        }
    };
    if pttl <= 0 {
        add("ExpiredCalls");
        debug!("calls: message {} expired, dropping call", cp.msg_uuid);
        return;
    }

    cp.read_at = Some(Instant::now());
    cp.ttl_after_read = Duration::from_millis(pttl as u64);
    add("Calls");
    let _ = tx.send(cp).await;
}
