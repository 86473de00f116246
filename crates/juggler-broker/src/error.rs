use std::error::Error;
use std::fmt;

/// Failure talking to the store or encoding a payload for it.
#[derive(Debug)]
pub enum BrokerError {
    /// The store rejected or could not complete a command. Script errors
    /// (e.g. "list capacity exceeded") surface here.
    Redis(redis::RedisError),
    /// Payload serialization failed.
    Encode(serde_json::Error),
    /// A dedicated connection terminated.
    Closed(&'static str),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Redis(e) => write!(f, "redis: {e}"),
            BrokerError::Encode(e) => write!(f, "encode: {e}"),
            BrokerError::Closed(what) => write!(f, "{what} closed"),
        }
    }
}

impl Error for BrokerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BrokerError::Redis(e) => Some(e),
            BrokerError::Encode(e) => Some(e),
            BrokerError::Closed(_) => None,
        }
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        BrokerError::Redis(e)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Encode(e)
    }
}
