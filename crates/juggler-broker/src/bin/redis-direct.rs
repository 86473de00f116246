//! Measure raw redis push/pop throughput with the broker's data shapes,
//! bypassing the gateway entirely. Useful to find out how much of the
//! end-to-end cost is redis and how much is juggler.
//!
//! Execution types:
//!
//! - 0: pure LPUSH/BRPOP with a static payload
//! - 1: marshal a call payload on push, unmarshal it on pop
//! - 2: full broker discipline, enqueue script on push and PTTL/DEL script
//!   on pop

use std::process::ExitCode;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use once_cell::sync::Lazy;
use uuid::Uuid;

use juggler_wire::CallPayload;

const LIST_KEY: &str = "test:list";

static PUSH_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
redis.call("SET", KEYS[1], ARGV[1], "PX", tonumber(ARGV[1]))
local res = redis.call("LPUSH", KEYS[2], ARGV[2])
local limit = tonumber(ARGV[3])
if res > limit and limit > 0 then
    local diff = res - limit
    redis.call("LTRIM", KEYS[2], diff, limit + diff)
    return redis.error_reply("list capacity exceeded")
end
return res
"#,
    )
});

static POP_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local res = redis.call("PTTL", KEYS[1])
redis.call("DEL", KEYS[1])
return res
"#,
    )
});

#[derive(Debug, Parser)]
#[command(name = "redis-direct", about = "Raw redis throughput for juggler payloads")]
struct Args {
    /// Duration of the test, in milliseconds.
    #[arg(short = 'd', long, default_value_t = 10_000)]
    duration_ms: u64,

    /// Type of execution (0, 1 or 2).
    #[arg(short = 'e', long, default_value_t = 0)]
    exec_type: u8,

    /// Number of concurrent pusher/popper pairs.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Redis address.
    #[arg(long, default_value = "127.0.0.1:6379")]
    redis: String,
}

fn test_payload() -> CallPayload {
    CallPayload::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "test.delay",
        serde_json::json!("0"),
    )
}

async fn connect(addr: &str) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
    let url = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    };
    redis::Client::open(url)?.get_multiplexed_async_connection().await
}

async fn pusher(
    addr: String,
    exec_type: u8,
    deadline: Instant,
    count: Arc<AtomicI64>,
) -> redis::RedisResult<()> {
    let mut conn = connect(&addr).await?;
    while Instant::now() < deadline {
        match exec_type {
            0 => {
                let _: i64 = redis::cmd("LPUSH")
                    .arg(LIST_KEY)
                    .arg("payload")
                    .query_async(&mut conn)
                    .await?;
            }
            1 => {
                let cp = test_payload();
                let payload = serde_json::to_string(&cp).map_err(encode_err)?;
                let _: i64 = redis::cmd("LPUSH")
                    .arg(LIST_KEY)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await?;
            }
            _ => {
                let cp = test_payload();
                let payload = serde_json::to_string(&cp).map_err(encode_err)?;
                let _: i64 = PUSH_SCRIPT
                    .key(format!("test:expire:{}", cp.msg_uuid))
                    .key(LIST_KEY)
                    .arg(2000)
                    .arg(payload)
                    .arg(0)
                    .invoke_async(&mut conn)
                    .await?;
            }
        }
        count.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

async fn popper(
    addr: String,
    exec_type: u8,
    count: Arc<AtomicI64>,
) -> redis::RedisResult<()> {
    let mut conn = connect(&addr).await?;
    loop {
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(LIST_KEY)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let Some((_key, payload)) = popped else {
            continue;
        };
        if exec_type >= 1 {
            let cp: CallPayload = serde_json::from_str(&payload).map_err(encode_err)?;
            if exec_type >= 2 {
                let _: i64 = POP_SCRIPT
                    .key(format!("test:expire:{}", cp.msg_uuid))
                    .invoke_async(&mut conn)
                    .await?;
            }
        }
        count.fetch_add(1, Ordering::Relaxed);
    }
}

fn encode_err(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "payload encode", e.to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if args.exec_type > 2 {
        eprintln!("unknown exec type: {}", args.exec_type);
        return ExitCode::from(3);
    }

    let push = Arc::new(AtomicI64::new(0));
    let pop = Arc::new(AtomicI64::new(0));
    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);

    let mut poppers = Vec::new();
    let mut pushers = Vec::new();
    for _ in 0..args.workers.max(1) {
        poppers.push(tokio::spawn(popper(
            args.redis.clone(),
            args.exec_type,
            Arc::clone(&pop),
        )));
        pushers.push(tokio::spawn(pusher(
            args.redis.clone(),
            args.exec_type,
            deadline,
            Arc::clone(&push),
        )));
    }

    for handle in pushers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("push failed: {e}");
                return ExitCode::from(2);
            }
            Err(e) => {
                eprintln!("push task failed: {e}");
                return ExitCode::from(2);
            }
        }
    }

    // let the poppers drain what the pushers queued, then stop them
    tokio::time::sleep(Duration::from_secs(1)).await;
    for handle in &poppers {
        handle.abort();
    }

    println!(
        "push: {}, pop: {}",
        push.load(Ordering::Relaxed),
        pop.load(Ordering::Relaxed)
    );
    ExitCode::SUCCESS
}
