//! A testing callee that serves simple URI functions:
//!
//! - `test.echo` (string): returns the received string
//! - `test.reverse` (string): reverses each char in the received string
//! - `test.delay` (string): sleeps for the duration received as string
//!   (milliseconds), then returns it
//!
//! With `-n N`, additional `test.delay.0` … `test.delay.N-1` URIs are
//! served so load can spread over several queues.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use juggler_broker::redisbroker::{RedisBroker, RedisPool};
use juggler_broker::{CalleeBroker, Vars};
use juggler_callee::{thunk, Callee, CalleeError, Thunk, ThunkError};
use juggler_wire::CallPayload;

#[derive(Debug, Parser)]
#[command(name = "juggler-callee", about = "Testing callee for juggler")]
struct Args {
    /// Blocking timeout when polling for call requests, in milliseconds.
    #[arg(long, default_value_t = 0)]
    broker_blocking_timeout_ms: u64,

    /// Capacity of the results queue.
    #[arg(long, default_value_t = 0)]
    broker_result_cap: i64,

    /// Number of test.delay URIs.
    #[arg(short = 'n', long, default_value_t = 0)]
    num_delay_uris: usize,

    /// HTTP server port to serve debug endpoints.
    #[arg(long, default_value_t = 9001)]
    port: u16,

    /// Redis address.
    #[arg(long, default_value = "127.0.0.1:6379")]
    redis: String,

    /// Use redis cluster.
    #[arg(long)]
    redis_cluster: bool,

    /// Number of concurrent workers processing call requests.
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

fn as_string(args: &Value) -> Result<String, ThunkError> {
    match args.as_str() {
        Some(s) => Ok(s.to_string()),
        None => Err("expected a string argument".into()),
    }
}

async fn echo(cp: CallPayload) -> Result<Value, ThunkError> {
    Ok(Value::String(as_string(&cp.args)?))
}

async fn reverse(cp: CallPayload) -> Result<Value, ThunkError> {
    let s = as_string(&cp.args)?;
    Ok(Value::String(s.chars().rev().collect()))
}

async fn delay(cp: CallPayload) -> Result<Value, ThunkError> {
    let s = as_string(&cp.args)?;
    let ms: u64 = s.parse().map_err(|_| "expected a number of milliseconds")?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(Value::String(s))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let workers = args.workers.max(1);

    let mut thunks: BTreeMap<String, Thunk> = BTreeMap::new();
    thunks.insert("test.echo".to_string(), thunk(echo));
    thunks.insert("test.reverse".to_string(), thunk(reverse));
    thunks.insert("test.delay".to_string(), thunk(delay));
    for i in 0..args.num_delay_uris {
        thunks.insert(format!("test.delay.{i}"), thunk(delay));
    }

    let pool = match RedisPool::connect(&args.redis, args.redis_cluster).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("redis connect failed: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = pool.ping().await {
        eprintln!("redis PING failed: {e}");
        return ExitCode::from(2);
    }

    let vars = Arc::new(Vars::new());
    let mut broker = RedisBroker::new(pool);
    broker.blocking_timeout = Duration::from_millis(args.broker_blocking_timeout_ms);
    broker.result_cap = args.broker_result_cap;
    broker.vars = Some(Arc::clone(&vars));
    let broker = Arc::new(broker);

    // debug endpoints
    let debug_vars = Arc::clone(&vars);
    let app = Router::new().route(
        "/debug/vars",
        get(move || {
            let vars = Arc::clone(&debug_vars);
            async move { Json(vars.snapshot()) }
        }),
    );
    let debug_addr = format!("0.0.0.0:{}", args.port);
    info!("serving debug endpoints on {debug_addr}");
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&debug_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    warn!("debug server failed: {e}");
                }
            }
            Err(e) => warn!("debug server bind failed: {e}"),
        }
    });

    info!(
        "listening for call requests on {} with {workers} workers",
        args.redis
    );
    let uris: Vec<String> = thunks.keys().cloned().collect();
    let calls = match broker.calls_conn(&uris).await {
        Ok(calls) => calls,
        Err(e) => {
            eprintln!("calls connection failed: {e}");
            return ExitCode::from(2);
        }
    };
    let calls = Arc::new(tokio::sync::Mutex::new(calls));
    let callee = Arc::new(Callee::new(broker));
    let thunks = Arc::new(thunks);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let calls = Arc::clone(&calls);
        let callee = Arc::clone(&callee);
        let thunks = Arc::clone(&thunks);
        let vars = Arc::clone(&vars);
        handles.push(tokio::spawn(async move {
            worker_loop(calls, callee, thunks, vars).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    if let Some(e) = calls.lock().await.terminal_err() {
        eprintln!("calls stream failed: {e}");
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

async fn worker_loop(
    calls: Arc<tokio::sync::Mutex<juggler_broker::CallsStream>>,
    callee: Arc<Callee>,
    thunks: Arc<BTreeMap<String, Thunk>>,
    vars: Arc<Vars>,
) {
    loop {
        // the lock is only held while waiting for the next request
        let cp = {
            let mut calls = calls.lock().await;
            match calls.recv().await {
                Some(cp) => cp,
                None => return,
            }
        };

        let uri = cp.uri.clone();
        let msg_uuid = cp.msg_uuid;
        info!("received request {msg_uuid} {uri}");
        vars.add("Requests", 1);
        vars.add(&format!("Requests.{uri}"), 1);

        let Some(thunk) = thunks.get(&uri) else {
            continue;
        };
        match callee.invoke_and_store_result(cp, thunk).await {
            Ok(()) => {
                info!("sent result {msg_uuid} {uri}");
                vars.add("Succeeded", 1);
                vars.add(&format!("Succeeded.{uri}"), 1);
            }
            Err(CalleeError::CallExpired) => {
                info!("expired request {msg_uuid} {uri}");
                vars.add("Expired", 1);
                vars.add(&format!("Expired.{uri}"), 1);
            }
            Err(e) => {
                warn!("invoke failed: {e}");
                vars.add("Failed", 1);
                vars.add(&format!("Failed.{uri}"), 1);
            }
        }
    }
}
