//! The exclusive writer: at most one frame in flight per connection.
//!
//! The sink half of the websocket sits behind an async mutex; acquisition
//! races a timer so a writer stuck behind a slow peer fails with a
//! lock-timeout instead of blocking forever. The frame is encoded under the
//! configured write limit before any bytes reach the socket, so a too-large
//! message is refused whole.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

use juggler_wire::{encode_frame, Msg};

use crate::conn::ConnError;

pub use juggler_wire::WriteError;

pub(crate) struct WsWriter {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    acquire_timeout: Duration,
    write_timeout: Duration,
    write_limit: usize,
}

impl WsWriter {
    pub(crate) fn new(
        sink: SplitSink<WebSocket, Message>,
        acquire_timeout: Duration,
        write_timeout: Duration,
        write_limit: usize,
    ) -> WsWriter {
        WsWriter {
            sink: Mutex::new(sink),
            acquire_timeout,
            write_timeout,
            write_limit,
        }
    }

    pub(crate) async fn write_msg(&self, m: &Msg) -> Result<(), ConnError> {
        let mut sink = if self.acquire_timeout.is_zero() {
            self.sink.lock().await
        } else {
            tokio::time::timeout(self.acquire_timeout, self.sink.lock())
                .await
                .map_err(|_| ConnError::Write(WriteError::LockTimeout))?
        };

        let frame = encode_frame(m, self.write_limit).map_err(ConnError::Write)?;

        let send = sink.send(Message::Text(frame.into()));
        if self.write_timeout.is_zero() {
            send.await.map_err(ConnError::Ws)?;
        } else {
            tokio::time::timeout(self.write_timeout, send)
                .await
                .map_err(|_| ConnError::WriteTimeout)?
                .map_err(ConnError::Ws)?;
        }
        Ok(())
    }
}
