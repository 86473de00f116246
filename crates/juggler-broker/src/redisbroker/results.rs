//! Dequeue loop for call results.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use juggler_wire::ResPayload;

use crate::{BrokerError, ResultsStream, Vars};

use super::calls::brpop;
use super::pool::PoolConn;
use super::{del_pttl, res_key, res_timeout_key};

/// Start the dequeue loop over the result queue of `conn_uuid` and return
/// its stream.
pub(super) fn start(
    mut conn: PoolConn,
    script_conn: PoolConn,
    conn_uuid: Uuid,
    blocking_timeout: Duration,
    vars: Option<Arc<Vars>>,
) -> ResultsStream {
    let (stream, mut feeder) = ResultsStream::pair(1);

    tokio::spawn(async move {
        let keys = vec![res_key(conn_uuid)];
        let secs = blocking_timeout.as_secs();

        loop {
            tokio::select! {
                _ = feeder.stopped() => break,
                popped = brpop(&mut conn, &keys, secs) => match popped {
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
    });

    stream
}

async fn deliver(
    mut script_conn: PoolConn,
    payload: String,
    tx: mpsc::Sender<ResPayload>,
    vars: Option<Arc<Vars>>,
) {
    let add = |name: &str| {
        if let Some(v) = &vars {
            v.add(name, 1);
        }
    };

    let rp: ResPayload = match serde_json::from_str(&payload) {
        Ok(rp) => rp,
        Err(e) => {
            add("FailedResPayloadUnmarshals");
            warn!("results: failed to unmarshal result payload: {e}");
            return;
        }
    };

    let key = res_timeout_key(rp.conn_uuid, rp.msg_uuid);
    let pttl = match del_pttl(&mut script_conn, &key).await {
        Ok(pttl) => pttl,
        Err(e) => {
            add("FailedPTTLResults");
            warn!("results: DEL/PTTL failed: {e}");
            return;
        }
    };
    if pttl <= 0 {
        add("ExpiredResults");
        debug!("results: message {} expired, dropping result", rp.msg_uuid);
        return;
    }

    add("Results");
    let _ = tx.send(rp).await;
}
