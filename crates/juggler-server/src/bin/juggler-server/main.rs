//! The juggler gateway server binary. Mostly a testing and debugging tool;
//! typical applications embed the `juggler-server` crate in their own
//! binary.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use juggler_broker::redisbroker::{RedisBroker, RedisPool};
use juggler_broker::{CallerBroker, PubSubBroker, Vars};
use juggler_server::{
    log_conn, process_msg, router_with_paths, Chain, Conn, Handler, LogMsg, PanicRecover, Server,
};
use juggler_wire::Msg;

use config::{Config, RedisConfig};

#[derive(Debug, Parser)]
#[command(name = "juggler-server", about = "Websocket RPC and pub-sub gateway")]
struct Args {
    /// Path of the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server port, when the configuration file sets no address.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Redis address, when the configuration file sets none.
    #[arg(long, default_value = "127.0.0.1:6379")]
    redis: String,

    /// Use redis cluster.
    #[arg(long)]
    redis_cluster: bool,

    /// Allow an empty subprotocol during the handshake.
    #[arg(long)]
    allow_empty_subprotocol: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

// Testing hooks: a CALL to close_uri drops the connection, a CALL to
// panic_uri panics in the handler (exercising PanicRecover).
struct ServerHandler {
    close_uri: String,
    panic_uri: String,
}

#[async_trait]
impl Handler for ServerHandler {
    async fn handle(&self, conn: &Arc<Conn>, msg: Msg) {
        if let Msg::Call(call) = &msg {
            if !self.close_uri.is_empty() && call.payload.uri == self.close_uri {
                conn.close(None);
                return;
            }
            if !self.panic_uri.is_empty() && call.payload.uri == self.panic_uri {
                panic!("called panic URI");
            }
        }
        process_msg(conn, msg).await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration file: {e}");
            return ExitCode::from(3);
        }
    };
    if config.redis.addr.is_empty() && config.redis.pubsub.is_none() {
        config.redis.addr = args.redis.clone();
        config.redis.cluster = args.redis_cluster;
    }
    if config.server.addr.is_empty() {
        config.server.addr = format!("0.0.0.0:{}", args.port);
    }
    if args.allow_empty_subprotocol {
        config.server.allow_empty_subprotocol = true;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let vars = Arc::new(Vars::new());

    let (pubsub_broker, caller_broker) = make_brokers(&config, &vars).await?;

    let mut server = Server::new(pubsub_broker, caller_broker);
    server.read_limit = config.server.read_limit;
    server.read_timeout = Duration::from_millis(config.server.read_timeout_ms);
    server.write_limit = config.server.write_limit;
    server.write_timeout = Duration::from_millis(config.server.write_timeout_ms);
    server.acquire_write_lock_timeout =
        Duration::from_millis(config.server.acquire_write_lock_timeout_ms);
    server.slow_process_threshold = Duration::from_millis(config.server.slow_process_threshold_ms);
    server.allow_empty_subprotocol = config.server.allow_empty_subprotocol;
    server.conn_state = Some(Arc::new(log_conn));
    server.vars = Some(Arc::clone(&vars));
    server.handler = Some(Arc::new(PanicRecover::new(Arc::new(Chain::new(vec![
        Arc::new(LogMsg),
        Arc::new(ServerHandler {
            close_uri: config.server.close_uri.clone(),
            panic_uri: config.server.panic_uri.clone(),
        }),
    ])))));

    let mut app = router_with_paths(Arc::new(server), &config.server.paths);
    if !config.server.whitelisted_origins.is_empty() {
        let origins = Arc::new(config.server.whitelisted_origins.clone());
        app = app.layer(middleware::from_fn(move |req: Request, next: Next| {
            let origins = Arc::clone(&origins);
            check_origin(origins, req, next)
        }));
    }

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    info!("listening for connections on {}", config.server.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn check_origin(origins: Arc<Vec<String>>, req: Request, next: Next) -> Response {
    let allowed = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(|o| origins.iter().any(|w| w == o))
        .unwrap_or(false);
    if !allowed {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await
}

async fn make_brokers(
    config: &Config,
    vars: &Arc<Vars>,
) -> Result<(Arc<dyn PubSubBroker>, Arc<dyn CallerBroker>), Box<dyn std::error::Error + Send + Sync>>
{
    let caller = |pool: RedisPool| {
        let mut broker = RedisBroker::new(pool);
        broker.blocking_timeout = Duration::from_millis(config.caller_broker.blocking_timeout_ms);
        broker.call_cap = config.caller_broker.call_cap;
        broker.vars = Some(Arc::clone(vars));
        broker
    };

    match (&config.redis.pubsub, &config.redis.caller) {
        (Some(pubsub), Some(caller_conf)) => {
            let pubsub_pool = connect(pubsub).await?;
            let caller_pool = connect(caller_conf).await?;
            info!(
                "redis configured on {} (pubsub) and {} (caller)",
                pubsub.addr, caller_conf.addr
            );
            let mut pubsub_broker = RedisBroker::new(pubsub_pool);
            pubsub_broker.vars = Some(Arc::clone(vars));
            Ok((Arc::new(pubsub_broker), Arc::new(caller(caller_pool))))
        }
        _ => {
            let pool = connect(&config.redis).await?;
            info!("redis configured on {}", config.redis.addr);
            let broker = Arc::new(caller(pool));
            Ok((Arc::clone(&broker) as Arc<dyn PubSubBroker>, broker))
        }
    }
}

async fn connect(conf: &RedisConfig) -> Result<RedisPool, Box<dyn std::error::Error + Send + Sync>> {
    let pool = RedisPool::connect(&conf.addr, conf.cluster).await?;
    pool.ping().await?;
    Ok(pool)
}
