#![deny(unsafe_code)]

//! Callee workers for the juggler protocol.
//!
//! A callee listens for call requests on a set of URIs through a
//! [`CalleeBroker`], runs the matching handler, and stores the result so the
//! broker can route it back to the calling connection. The call's TTL keeps
//! counting down while the handler runs: a result produced after the TTL
//! elapsed is dropped, because the client has already treated the call as
//! expired.
//!
//! [`Callee::listen`] is the single-consumer convenience loop. For
//! worker-pool setups, open a calls stream once and feed
//! [`Callee::invoke_and_store_result`] from several tasks sharing the
//! receiver.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use juggler_broker::{BrokerError, CalleeBroker};
use juggler_wire::{CallPayload, ErrResult, ResPayload};

/// Error type returned by handler thunks.
pub type ThunkError = Box<dyn Error + Send + Sync>;

/// A handler for calls to a URI. Generally it decodes the payload's args
/// into the type the underlying function expects, calls it, and marshals
/// the result back into a JSON value.
pub type Thunk = Arc<
    dyn Fn(CallPayload) -> Pin<Box<dyn Future<Output = Result<Value, ThunkError>> + Send>>
        + Send
        + Sync,
>;

/// Adapt an async function into a [`Thunk`].
pub fn thunk<F, Fut>(f: F) -> Thunk
where
    F: Fn(CallPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ThunkError>> + Send + 'static,
{
    Arc::new(move |cp| Box::pin(f(cp)))
}

/// A handler error that carries its own JSON form. When a thunk fails with
/// this type, the wrapped value is stored as the call result instead of the
/// generic error shape.
#[derive(Debug)]
pub struct JsonError(pub Value);

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for JsonError {}

/// Callee failure.
#[derive(Debug)]
pub enum CalleeError {
    /// The handler finished after the call's TTL elapsed; the result was
    /// dropped.
    CallExpired,
    /// The handler's result could not be marshaled.
    Encode(serde_json::Error),
    /// Broker failure.
    Broker(Arc<BrokerError>),
}

impl fmt::Display for CalleeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalleeError::CallExpired => write!(f, "call expired"),
            CalleeError::Encode(e) => write!(f, "encode: {e}"),
            CalleeError::Broker(e) => write!(f, "broker: {e}"),
        }
    }
}

impl Error for CalleeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CalleeError::Encode(e) => Some(e),
            CalleeError::Broker(e) => Some(e.as_ref()),
            CalleeError::CallExpired => None,
        }
    }
}

/// A peer that executes call requests for some URIs.
pub struct Callee {
    broker: Arc<dyn CalleeBroker>,
}

impl Callee {
    pub fn new(broker: Arc<dyn CalleeBroker>) -> Callee {
        Callee { broker }
    }

    /// Run `thunk` for `cp` and store its result with the TTL budget that
    /// remains after execution. Returns [`CalleeError::CallExpired`] and
    /// drops the result when the budget is spent.
    pub async fn invoke_and_store_result(
        &self,
        cp: CallPayload,
        thunk: &Thunk,
    ) -> Result<(), CalleeError> {
        let ttl = cp.ttl_after_read;
        let start = Instant::now();

        let result = thunk(cp.clone()).await;

        let Some(remaining) = ttl.checked_sub(start.elapsed()).filter(|r| !r.is_zero()) else {
            return Err(CalleeError::CallExpired);
        };

        let args = match result {
            Ok(v) => v,
            // an error that knows its JSON form is stored as-is, anything
            // else becomes the generic error shape
            Err(e) => match e.downcast_ref::<JsonError>() {
                Some(JsonError(v)) => v.clone(),
                None => serde_json::to_value(ErrResult::new(e.to_string()))
                    .map_err(CalleeError::Encode)?,
            },
        };

        let rp = ResPayload {
            conn_uuid: cp.conn_uuid,
            msg_uuid: cp.msg_uuid,
            uri: cp.uri,
            args,
        };
        self.broker
            .result(&rp, remaining)
            .await
            .map_err(|e| CalleeError::Broker(Arc::new(e)))
    }

    /// Listen for call requests on the URIs of `thunks` and execute them
    /// one at a time. Store errors are ignored; use
    /// [`invoke_and_store_result`] directly to handle them. Blocks until
    /// the calls stream stops and returns its terminal error, if any.
    ///
    /// With a clustered store, all URIs must belong to the same hash slot.
    ///
    /// [`invoke_and_store_result`]: Callee::invoke_and_store_result
    pub async fn listen(&self, thunks: BTreeMap<String, Thunk>) -> Result<(), CalleeError> {
        if thunks.is_empty() {
            return Ok(());
        }

        let uris: Vec<String> = thunks.keys().cloned().collect();
        let mut calls = self
            .broker
            .calls_conn(&uris)
            .await
            .map_err(|e| CalleeError::Broker(Arc::new(e)))?;

        while let Some(cp) = calls.recv().await {
            let Some(thunk) = thunks.get(&cp.uri) else {
                continue;
            };
            if let Err(e) = self.invoke_and_store_result(cp, thunk).await {
                debug!("invoke failed: {e}");
            }
        }

        match calls.terminal_err() {
            Some(e) => Err(CalleeError::Broker(e)),
            None => Ok(()),
        }
    }
}
