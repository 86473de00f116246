//! Dequeue streams handed out by the broker.
//!
//! A stream is the consuming half of an mpsc channel fed by a dedicated
//! store connection. Delivery tasks each hold a sender clone, so the channel
//! only closes once the feeding loop has exited *and* every in-flight
//! delivery has drained. The terminal error that stopped the loop is read
//! after the stream yields `None`.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use juggler_wire::{CallPayload, EvntPayload, ResPayload};

use crate::error::BrokerError;

type ErrSlot = Arc<Mutex<Option<Arc<BrokerError>>>>;

/// Stream of call requests for the URIs a callee listens on.
pub type CallsStream = BrokerStream<CallPayload>;
/// Stream of call results for one connection.
pub type ResultsStream = BrokerStream<ResPayload>;
/// Stream of events for one pub/sub session.
pub type EventsStream = BrokerStream<EvntPayload>;

/// Consuming half of a broker dequeue loop.
pub struct BrokerStream<T> {
    rx: mpsc::Receiver<T>,
    err: ErrSlot,
    stop: watch::Sender<bool>,
}

impl<T> BrokerStream<T> {
    /// Create a stream and its feeding half. Used by broker implementations;
    /// tests use it to stand in for a store-backed loop.
    pub fn pair(buffer: usize) -> (BrokerStream<T>, StreamFeeder<T>) {
        let (tx, rx) = mpsc::channel(buffer);
        let err: ErrSlot = Arc::default();
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            BrokerStream {
                rx,
                err: Arc::clone(&err),
                stop: stop_tx,
            },
            StreamFeeder {
                tx,
                err,
                stop: stop_rx,
            },
        )
    }

    /// Next payload, or `None` once the loop has exited and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// The error that terminated the loop, meaningful after [`recv`]
    /// returned `None`.
    ///
    /// [`recv`]: BrokerStream::recv
    pub fn terminal_err(&self) -> Option<Arc<BrokerError>> {
        self.err.lock().unwrap().clone()
    }

    /// Ask the feeding loop to stop. Dropping the stream has the same
    /// effect.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }
}

/// Feeding half of a [`BrokerStream`]: the sender for payloads, the slot for
/// the terminal error, and the stop signal to watch.
pub struct StreamFeeder<T> {
    pub tx: mpsc::Sender<T>,
    err: ErrSlot,
    stop: watch::Receiver<bool>,
}

impl<T> StreamFeeder<T> {
    /// Record the loop's terminal error; only the first error sticks.
    pub fn fail(&self, e: BrokerError) {
        let mut slot = self.err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Arc::new(e));
        }
    }

    /// Resolves when the consumer asked the loop to stop or dropped the
    /// stream.
    pub async fn stopped(&mut self) {
        // changed() errs when the stream (sender side of the watch) is gone,
        // which also means stop
        let _ = self.stop.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_flight_before_close() {
        let (mut stream, feeder) = BrokerStream::<u32>::pair(1);

        let tx2 = feeder.tx.clone();
        tokio::spawn(async move {
            tx2.send(1).await.unwrap();
            tx2.send(2).await.unwrap();
        });
        drop(feeder); // loop exited, delivery task still holds a sender

        assert_eq!(stream.recv().await, Some(1));
        assert_eq!(stream.recv().await, Some(2));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn terminal_error_first_wins() {
        let (mut stream, mut feeder) = BrokerStream::<u32>::pair(1);
        feeder.fail(BrokerError::Closed("dequeue connection"));
        feeder.fail(BrokerError::Closed("something else"));

        stream.close();
        feeder.stopped().await;
        drop(feeder);

        assert_eq!(stream.recv().await, None);
        let err = stream.terminal_err().unwrap();
        assert!(err.to_string().contains("dequeue connection"));
    }
}
