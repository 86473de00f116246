//! Server configuration file (TOML) and its validation.

use std::error::Error;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub redis: RedisConfig,
    pub caller_broker: CallerBrokerConfig,
    pub server: ServerConfig,
}

/// Redis connection options. Either `addr` alone (one connection source for
/// pub/sub and caller traffic), or both `pubsub` and `caller` sections for
/// split backends.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    pub addr: String,
    pub cluster: bool,
    pub pubsub: Option<Box<RedisConfig>>,
    pub caller: Option<Box<RedisConfig>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallerBrokerConfig {
    /// Wait per blocking pop, in milliseconds; 0 blocks indefinitely.
    pub blocking_timeout_ms: u64,
    /// Per-URI call queue capacity; 0 disables the cap.
    pub call_cap: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address; when empty, built from the --port flag.
    pub addr: String,
    /// Paths serving the websocket upgrade endpoint.
    pub paths: Vec<String>,
    pub read_limit: usize,
    pub read_timeout_ms: u64,
    pub write_limit: usize,
    pub write_timeout_ms: u64,
    pub acquire_write_lock_timeout_ms: u64,
    pub slow_process_threshold_ms: u64,
    pub allow_empty_subprotocol: bool,
    /// When non-empty, the Origin request header must match one of these.
    pub whitelisted_origins: Vec<String>,
    /// A CALL to this URI makes the server close the connection (testing
    /// hook).
    pub close_uri: String,
    /// A CALL to this URI makes the handler panic (testing hook).
    pub panic_uri: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: String::new(),
            paths: vec!["/ws".to_string()],
            read_limit: 0,
            read_timeout_ms: 0,
            write_limit: 0,
            write_timeout_ms: 0,
            acquire_write_lock_timeout_ms: 0,
            slow_process_threshold_ms: 50,
            allow_empty_subprotocol: false,
            whitelisted_origins: Vec::new(),
            close_uri: String::new(),
            panic_uri: String::new(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "read: {e}"),
            ConfigError::Parse(e) => write!(f, "parse: {e}"),
            ConfigError::Invalid(what) => write!(f, "{what}"),
        }
    }
}

impl Error for ConfigError {}

/// Load the configuration file, or the defaults when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&text).map_err(ConfigError::Parse)?
        }
        None => Config::default(),
    };
    check_redis(&config.redis)?;
    Ok(config)
}

// Either the flat redis section, or both the pubsub and caller subsections;
// no other combination is accepted.
fn check_redis(redis: &RedisConfig) -> Result<(), ConfigError> {
    let pubsub_set = redis.pubsub.as_ref().is_some_and(|r| !r.addr.is_empty());
    let caller_set = redis.caller.as_ref().is_some_and(|r| !r.addr.is_empty());

    if redis.pubsub.is_some() || redis.caller.is_some() {
        if !pubsub_set || !caller_set {
            return Err(ConfigError::Invalid(
                "both redis.pubsub and redis.caller sections must be configured",
            ));
        }
        if !redis.addr.is_empty() {
            return Err(ConfigError::Invalid(
                "redis.addr must not be set when redis.pubsub and redis.caller are configured",
            ));
        }
    }
    Ok(())
}
