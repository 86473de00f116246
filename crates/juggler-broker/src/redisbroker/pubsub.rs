//! Pub/sub relay: one dedicated subscriber connection per gateway
//! connection, re-framing published payloads as events.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

use juggler_wire::{EvntPayload, PubPayload};

use crate::{BrokerError, EventsStream, PubSubCtl, PubSubSession, Vars};

/// Split the pub/sub connection: the sink half serves subscribe and
/// unsubscribe (serialized behind a mutex), the stream half feeds the event
/// loop.
pub(super) fn start(pubsub: redis::aio::PubSub, vars: Option<Arc<Vars>>) -> PubSubSession {
    let (sink, mut incoming) = pubsub.split();

    let (events, mut feeder) = EventsStream::pair(1);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = feeder.stopped() => break,
                msg = incoming.next() => match msg {
                    Some(msg) => {
                        let tx = feeder.tx.clone();
                        let vars = vars.clone();
                        tokio::spawn(deliver(msg, tx, vars));
                    }
                    None => {
                        feeder.fail(BrokerError::Closed("pub-sub connection"));
                        break;
                    }
                }
            }
        }
    });

    PubSubSession {
        ctl: Box::new(RedisPubSubCtl {
            sink: tokio::sync::Mutex::new(sink),
        }),
        events,
    }
}

struct RedisPubSubCtl {
    // subscribe/unsubscribe writes serialize through this lock
    sink: tokio::sync::Mutex<redis::aio::PubSubSink>,
}

#[async_trait]
impl PubSubCtl for RedisPubSubCtl {
    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError> {
        let mut sink = self.sink.lock().await;
        if pattern {
            sink.psubscribe(channel).await?;
        } else {
            sink.subscribe(channel).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError> {
        let mut sink = self.sink.lock().await;
        if pattern {
            sink.punsubscribe(channel).await?;
        } else {
            sink.unsubscribe(channel).await?;
        }
        Ok(())
    }
}

async fn deliver(msg: redis::Msg, tx: mpsc::Sender<EvntPayload>, vars: Option<Arc<Vars>>) {
    let add = |name: &str| {
        if let Some(v) = &vars {
            v.add(name, 1);
        }
    };

    let channel = msg.get_channel_name().to_string();
    let pattern: String = msg
        .get_pattern::<Option<String>>()
        .ok()
        .flatten()
        .unwrap_or_default();

    let pp: PubPayload = match serde_json::from_slice(msg.get_payload_bytes()) {
        Ok(pp) => pp,
        Err(e) => {
            add("FailedEvntPayloadUnmarshals");
            warn!("events: failed to unmarshal event payload: {e}");
            return;
        }
    };

    add("Events");
    let _ = tx
        .send(EvntPayload {
            msg_uuid: pp.msg_uuid,
            channel,
            pattern,
            args: pp.args,
        })
        .await;
}
