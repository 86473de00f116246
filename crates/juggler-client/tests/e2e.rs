//! Full-stack scenarios: gateway, callee and client against a live redis.
//!
//! Ignored by default; run with a reachable redis (address in
//! `JUGGLER_TEST_REDIS`, default `127.0.0.1:6379`) via
//! `cargo test -p juggler-client -- --ignored`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use juggler_broker::redisbroker::{RedisBroker, RedisPool};
use juggler_broker::Vars;
use juggler_callee::{thunk, Callee, Thunk, ThunkError};
use juggler_client::{Client, Handler, Incoming, Options};
use juggler_server::{router, Server};
use juggler_wire::{CallPayload, Msg};

struct Stack {
    addr: SocketAddr,
    echo_uri: String,
    delay_uri: String,
}

impl Stack {
    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

async fn redis_broker() -> Arc<RedisBroker> {
    let addr =
        std::env::var("JUGGLER_TEST_REDIS").unwrap_or_else(|_| "127.0.0.1:6379".to_string());
    let pool = RedisPool::connect(&addr, false).await.expect("redis connect");
    pool.ping().await.expect("redis ping");
    let mut broker = RedisBroker::new(pool);
    broker.blocking_timeout = Duration::from_secs(1);
    broker.vars = Some(Arc::new(Vars::new()));
    Arc::new(broker)
}

async fn echo(cp: CallPayload) -> Result<Value, ThunkError> {
    Ok(cp.args)
}

async fn delay(cp: CallPayload) -> Result<Value, ThunkError> {
    let ms: u64 = cp
        .args
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or("expected a number of milliseconds")?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(cp.args)
}

// One stack per test: unique URIs so runs don't see each other's queues.
async fn start_stack() -> Stack {
    let broker = redis_broker().await;

    let server = Server::new(broker.clone(), broker.clone());
    let app = router(Arc::new(server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let suffix = Uuid::new_v4().simple().to_string();
    let echo_uri = format!("test.echo.{suffix}");
    let delay_uri = format!("test.delay.{suffix}");

    let mut thunks: BTreeMap<String, Thunk> = BTreeMap::new();
    thunks.insert(echo_uri.clone(), thunk(echo));
    thunks.insert(delay_uri.clone(), thunk(delay));
    let callee = Callee::new(broker);
    tokio::spawn(async move {
        let _ = callee.listen(thunks).await;
    });

    Stack {
        addr,
        echo_uri,
        delay_uri,
    }
}

#[derive(Default)]
struct Recorder {
    msgs: Mutex<Vec<Incoming>>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, msg: Incoming) {
        self.msgs.lock().unwrap().push(msg);
    }
}

impl Recorder {
    fn count(&self, pred: impl Fn(&Incoming) -> bool) -> usize {
        self.msgs.lock().unwrap().iter().filter(|m| pred(m)).count()
    }

    async fn wait_until(&self, pred: impl Fn(&Incoming) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.count(&pred) > 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("message did not arrive before the deadline");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn dial(stack: &Stack, recorder: &Arc<Recorder>) -> Client {
    Client::dial(
        &stack.url(),
        None,
        Arc::clone(recorder) as Arc<dyn Handler>,
        Options::default(),
    )
    .await
    .expect("dial")
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn happy_call_roundtrip() {
    let stack = start_stack().await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(&stack, &recorder).await;

    let start = Instant::now();
    let id = client
        .call(&stack.echo_uri, json!("hi"), Duration::from_secs(1))
        .await
        .unwrap();

    recorder
        .wait_until(|m| matches!(m, Incoming::Msg(Msg::Ack(ack)) if ack.payload.for_ == id))
        .await;
    recorder
        .wait_until(|m| {
            matches!(m, Incoming::Msg(Msg::Res(res)) if res.payload.for_ == id
                && res.payload.args == json!("hi"))
        })
        .await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(
        recorder.count(|m| matches!(m, Incoming::Exp(exp) if exp.payload.for_ == id)),
        0
    );
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn overrunning_call_expires() {
    let stack = start_stack().await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(&stack, &recorder).await;

    // the handler takes 500ms but the call only has 100ms
    let id = client
        .call(&stack.delay_uri, json!("500"), Duration::from_millis(100))
        .await
        .unwrap();

    recorder
        .wait_until(|m| matches!(m, Incoming::Msg(Msg::Ack(ack)) if ack.payload.for_ == id))
        .await;
    recorder
        .wait_until(|m| matches!(m, Incoming::Exp(exp) if exp.payload.for_ == id))
        .await;

    // the callee drops the overrun result, so no RES ever shows up
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        recorder.count(|m| matches!(m, Incoming::Msg(Msg::Res(res)) if res.payload.for_ == id)),
        0
    );
    assert_eq!(
        recorder.count(|m| matches!(m, Incoming::Exp(exp) if exp.payload.for_ == id)),
        1
    );
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn pubsub_fans_out_to_literal_and_pattern_subscribers() {
    let stack = start_stack().await;
    let channel = format!("c.{}", Uuid::new_v4().simple());

    let literal = Arc::new(Recorder::default());
    let literal_client = dial(&stack, &literal).await;
    literal_client.sub(&channel, false).await.unwrap();

    let pattern = Arc::new(Recorder::default());
    let pattern_client = dial(&stack, &pattern).await;
    let pat = format!("{channel}*");
    pattern_client.sub(&pat, true).await.unwrap();

    let other = Arc::new(Recorder::default());
    let other_client = dial(&stack, &other).await;
    other_client.sub("unrelated", false).await.unwrap();

    // wait for the ACKs so the subscriptions are in place before publishing
    for recorder in [&literal, &pattern, &other] {
        recorder
            .wait_until(|m| matches!(m, Incoming::Msg(Msg::Ack(_))))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let publisher = Arc::new(Recorder::default());
    let publisher_client = dial(&stack, &publisher).await;
    let pub_id = publisher_client.pub_(&channel, json!({"n": 1})).await.unwrap();

    literal
        .wait_until(|m| {
            matches!(m, Incoming::Msg(Msg::Evnt(ev)) if ev.payload.for_ == pub_id
                && ev.payload.channel == channel && ev.payload.pattern.is_empty())
        })
        .await;
    pattern
        .wait_until(|m| {
            matches!(m, Incoming::Msg(Msg::Evnt(ev)) if ev.payload.for_ == pub_id
                && ev.payload.pattern == pat)
        })
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        other.count(|m| matches!(m, Incoming::Msg(Msg::Evnt(_)))),
        0
    );
}
