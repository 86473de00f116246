#![deny(unsafe_code)]

//! Broker interfaces for the juggler gateway, and their redis
//! implementation.
//!
//! The broker moves three kinds of payloads: call requests (queued per URI
//! until a callee pops them), call results (queued per connection until the
//! gateway pops them), and published events (relayed through the store's
//! pub/sub primitives). Call and result queues pair a FIFO list with a
//! per-message expiring key so that a request whose timeout elapsed is
//! silently discarded by whoever pops it next.
//!
//! The gateway consumes the broker through the [`CallerBroker`] and
//! [`PubSubBroker`] traits, callees through [`CalleeBroker`]. The
//! [`redisbroker`] module implements all three on a single
//! [`redisbroker::RedisBroker`].

mod error;
mod stream;
mod vars;

pub mod redisbroker;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use juggler_wire::{CallPayload, PubPayload, ResPayload};

pub use error::BrokerError;
pub use stream::{BrokerStream, CallsStream, EventsStream, ResultsStream, StreamFeeder};
pub use vars::Vars;

pub use juggler_wire::DEFAULT_CALL_TIMEOUT;

/// Broker capabilities used by the gateway on behalf of callers.
#[async_trait]
pub trait CallerBroker: Send + Sync {
    /// Register a call request with the given TTL.
    async fn call(&self, cp: &CallPayload, timeout: Duration) -> Result<(), BrokerError>;

    /// Open a dedicated dequeue stream over the results queue of
    /// `conn_uuid`.
    async fn results_conn(&self, conn_uuid: Uuid) -> Result<ResultsStream, BrokerError>;
}

/// Broker capabilities used by callee workers.
#[async_trait]
pub trait CalleeBroker: Send + Sync {
    /// Register a call result with the given TTL.
    async fn result(&self, rp: &ResPayload, timeout: Duration) -> Result<(), BrokerError>;

    /// Open a dedicated dequeue stream over the call queues of `uris`. With
    /// a clustered store, all URIs must hash to the same slot.
    async fn calls_conn(&self, uris: &[String]) -> Result<CallsStream, BrokerError>;
}

/// Broker capabilities for pub/sub.
#[async_trait]
pub trait PubSubBroker: Send + Sync {
    /// Publish an event on a channel.
    async fn publish(&self, channel: &str, pp: &PubPayload) -> Result<(), BrokerError>;

    /// Open a dedicated pub/sub session: a control half for subscriptions
    /// and the stream of incoming events.
    async fn pubsub_conn(&self) -> Result<PubSubSession, BrokerError>;
}

/// Subscription control half of a pub/sub session. Subscribe and
/// unsubscribe calls serialize against each other.
#[async_trait]
pub trait PubSubCtl: Send + Sync {
    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError>;
}

/// A dedicated pub/sub session: subscription control plus the event stream
/// it feeds.
pub struct PubSubSession {
    pub ctl: Box<dyn PubSubCtl>,
    pub events: EventsStream,
}
