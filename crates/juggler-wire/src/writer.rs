//! Frame-write helpers shared by the gateway and the client: the byte-limit
//! writer and the error taxonomy for exclusive writes.

use std::error::Error;
use std::fmt;
use std::io;

use crate::msg::Msg;

/// Failure while producing or emitting an outbound frame.
#[derive(Debug)]
pub enum WriteError {
    /// The exclusive write lock could not be acquired before the deadline.
    /// No bytes were sent.
    LockTimeout,
    /// The encoded frame would exceed the configured write limit. No bytes
    /// were sent.
    LimitExceeded,
    /// Serialization failed.
    Encode(serde_json::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::LockTimeout => write!(f, "timed out waiting for write lock"),
            WriteError::LimitExceeded => write!(f, "write limit exceeded"),
            WriteError::Encode(e) => write!(f, "encode: {e}"),
        }
    }
}

impl Error for WriteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WriteError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

/// An `io::Write` adapter that accepts up to `limit` bytes. A write that
/// would exceed the budget fails whole, with zero bytes accepted from that
/// call.
pub struct LimitWriter<W> {
    inner: W,
    remaining: i64,
    exceeded: bool,
}

impl<W: io::Write> LimitWriter<W> {
    pub fn new(inner: W, limit: usize) -> Self {
        LimitWriter {
            inner,
            remaining: limit as i64,
            exceeded: false,
        }
    }

    /// True once a write has been refused for exceeding the limit.
    pub fn exceeded(&self) -> bool {
        self.exceeded
    }
}

impl<W: io::Write> io::Write for LimitWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.remaining -= buf.len() as i64;
        if self.remaining < 0 {
            self.exceeded = true;
            return Err(io::Error::other("write limit exceeded"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Encode `m` as a text frame, enforcing `limit` bytes when non-zero.
pub fn encode_frame(m: &Msg, limit: usize) -> Result<String, WriteError> {
    let mut buf = Vec::new();
    if limit > 0 {
        let mut lw = LimitWriter::new(&mut buf, limit);
        if let Err(e) = serde_json::to_writer(&mut lw, m) {
            if lw.exceeded() {
                return Err(WriteError::LimitExceeded);
            }
            return Err(WriteError::Encode(e));
        }
    } else {
        serde_json::to_writer(&mut buf, m).map_err(WriteError::Encode)?;
    }
    // serde_json output is valid UTF-8
    String::from_utf8(buf).map_err(|e| {
        WriteError::Encode(<serde_json::Error as serde::ser::Error>::custom(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn limit_writer_budget() {
        let mut buf = Vec::new();
        let mut w = LimitWriter::new(&mut buf, 10);
        assert_eq!(w.write(b"12345").unwrap(), 5);
        assert_eq!(w.write(b"67890").unwrap(), 5);
        assert!(w.write(b"x").is_err());
        assert!(w.exceeded());
        assert_eq!(buf, b"1234567890");
    }

    #[test]
    fn limit_writer_refuses_whole_write() {
        let mut buf = Vec::new();
        let mut w = LimitWriter::new(&mut buf, 4);
        assert!(w.write(b"12345").is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_frame_within_limit() {
        let m = Msg::new_sub("c", false);
        let unlimited = encode_frame(&m, 0).unwrap();
        let limited = encode_frame(&m, 4096).unwrap();
        assert_eq!(unlimited, limited);
    }

    #[test]
    fn encode_frame_over_limit() {
        let m = Msg::new_call("u", "x".repeat(4096), Duration::from_secs(1)).unwrap();
        match encode_frame(&m, 512) {
            Err(WriteError::LimitExceeded) => {}
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }
}
