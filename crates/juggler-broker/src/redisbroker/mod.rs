//! Redis-backed broker.
//!
//! Call requests and results live in redis lists, popped with `BRPOP`;
//! pub/sub events ride redis' native pub/sub. Each queued item pairs the
//! list entry with an expiring key (`PX` = the call timeout), written
//! atomically by a server-side script; the dequeuer deletes the expiring
//! key and reads its remaining TTL in one script, discarding items whose
//! TTL already elapsed.
//!
//! Key names put the hashed component inside `{…}` so that a list and its
//! per-message timeout keys land in the same cluster slot: call queues hash
//! on the URI, result queues on the calling connection's UUID. A heavily
//! solicited URI can be spread by suffixing it (`uri.0` … `uri.N`) and
//! letting callers pick a suffix at random.

mod calls;
mod pool;
mod pubsub;
mod results;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionLike;
use uuid::Uuid;

use juggler_wire::{CallPayload, PubPayload, ResPayload};

use crate::{
    BrokerError, CalleeBroker, CallerBroker, CallsStream, PubSubBroker, PubSubSession,
    ResultsStream, Vars, DEFAULT_CALL_TIMEOUT,
};

pub use pool::RedisPool;

// Stores the call request or result together with its expiration key. The
// list is trimmed back and the push refused when it would exceed a non-zero
// capacity.
static ENQUEUE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
redis.call("SET", KEYS[1], ARGV[1], "PX", tonumber(ARGV[1]))
local res = redis.call("LPUSH", KEYS[2], ARGV[2])
local limit = tonumber(ARGV[3])
if res > limit and limit > 0 then
    local diff = res - limit
    redis.call("LTRIM", KEYS[2], diff, limit + diff)
    return redis.error_reply("list capacity exceeded")
end
return res
"#,
    )
});

// Deletes the expiration key and returns the TTL it had left, in
// milliseconds.
static DEL_PTTL_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local res = redis.call("PTTL", KEYS[1])
redis.call("DEL", KEYS[1])
return res
"#,
    )
});

pub(crate) fn call_key(uri: &str) -> String {
    format!("juggler:calls:{{{uri}}}")
}

pub(crate) fn call_timeout_key(uri: &str, msg_uuid: Uuid) -> String {
    format!("juggler:calls:timeout:{{{uri}}}:{msg_uuid}")
}

pub(crate) fn res_key(conn_uuid: Uuid) -> String {
    format!("juggler:results:{{{conn_uuid}}}")
}

pub(crate) fn res_timeout_key(conn_uuid: Uuid, msg_uuid: Uuid) -> String {
    format!("juggler:results:timeout:{{{conn_uuid}}}:{msg_uuid}")
}

/// The redis broker. Implements [`CallerBroker`], [`CalleeBroker`] and
/// [`PubSubBroker`] over a [`RedisPool`].
pub struct RedisBroker {
    pool: RedisPool,
    /// Wait per `BRPOP` before re-issuing it; zero blocks indefinitely.
    /// Rounded down to whole seconds, the store's blocking-pop resolution.
    pub blocking_timeout: Duration,
    /// Per-URI call queue capacity; zero disables the cap.
    pub call_cap: i64,
    /// Per-connection result queue capacity; zero disables the cap.
    pub result_cap: i64,
    /// Broker counters, shared with the process metrics endpoint.
    pub vars: Option<Arc<Vars>>,
}

impl RedisBroker {
    pub fn new(pool: RedisPool) -> Self {
        RedisBroker {
            pool,
            blocking_timeout: Duration::ZERO,
            call_cap: 0,
            result_cap: 0,
            vars: None,
        }
    }
}

async fn enqueue<C: ConnectionLike + Send>(
    conn: &mut C,
    timeout_key: &str,
    list_key: &str,
    timeout: Duration,
    cap: i64,
    payload: &str,
) -> Result<(), BrokerError> {
    let mut timeout_ms = timeout.as_millis() as i64;
    if timeout_ms == 0 {
        timeout_ms = DEFAULT_CALL_TIMEOUT.as_millis() as i64;
    }

    let _: i64 = ENQUEUE_SCRIPT
        .key(timeout_key)
        .key(list_key)
        .arg(timeout_ms)
        .arg(payload)
        .arg(cap)
        .invoke_async(conn)
        .await?;
    Ok(())
}

async fn del_pttl<C: ConnectionLike + Send>(conn: &mut C, key: &str) -> Result<i64, BrokerError> {
    Ok(DEL_PTTL_SCRIPT.key(key).invoke_async(conn).await?)
}

#[async_trait]
impl CallerBroker for RedisBroker {
    async fn call(&self, cp: &CallPayload, timeout: Duration) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(cp)?;
        let mut conn = self.pool.shared();
        enqueue(
            &mut conn,
            &call_timeout_key(&cp.uri, cp.msg_uuid),
            &call_key(&cp.uri),
            timeout,
            self.call_cap,
            &payload,
        )
        .await
    }

    async fn results_conn(&self, conn_uuid: Uuid) -> Result<ResultsStream, BrokerError> {
        let conn = self.pool.dedicated().await?;
        Ok(results::start(
            conn,
            self.pool.shared(),
            conn_uuid,
            self.blocking_timeout,
            self.vars.clone(),
        ))
    }
}

#[async_trait]
impl CalleeBroker for RedisBroker {
    async fn result(&self, rp: &ResPayload, timeout: Duration) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(rp)?;
        let mut conn = self.pool.shared();
        enqueue(
            &mut conn,
            &res_timeout_key(rp.conn_uuid, rp.msg_uuid),
            &res_key(rp.conn_uuid),
            timeout,
            self.result_cap,
            &payload,
        )
        .await
    }

    async fn calls_conn(&self, uris: &[String]) -> Result<CallsStream, BrokerError> {
        let conn = self.pool.dedicated().await?;
        Ok(calls::start(
            conn,
            self.pool.shared(),
            uris.to_vec(),
            self.blocking_timeout,
            self.vars.clone(),
        ))
    }
}

#[async_trait]
impl PubSubBroker for RedisBroker {
    async fn publish(&self, channel: &str, pp: &PubPayload) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(pp)?;
        let mut conn = self.pool.shared();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pubsub_conn(&self) -> Result<PubSubSession, BrokerError> {
        let conn = self.pool.pubsub().await?;
        Ok(pubsub::start(conn, self.vars.clone()))
    }
}
