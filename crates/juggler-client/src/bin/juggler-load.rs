//! A juggler load generator. Runs a number of client connections against a
//! server and, for a given duration, makes calls and collects results and
//! statistics, including the server's before/after metric deltas.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use juggler_client::{Client, Handler, Incoming, Options};
use juggler_wire::{Msg, MsgType};

#[derive(Debug, Parser)]
#[command(name = "juggler-load", about = "Load generator for a juggler server")]
struct Args {
    /// Server address.
    #[arg(long, default_value = "ws://localhost:9000/ws")]
    addr: String,

    /// Number of connections.
    #[arg(short = 'c', long, default_value_t = 100)]
    conns: usize,

    /// Run duration, in milliseconds.
    #[arg(short = 'd', long, default_value_t = 10_000)]
    duration_ms: u64,

    /// Start execution after this delay, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Spread calls to this number of URIs (suffix appended to the URI).
    #[arg(short = 'n', long, default_value_t = 0)]
    num_uris: u32,

    /// Call payload.
    #[arg(short = 'p', long, default_value = "100")]
    payload: String,

    /// Call rate per connection, in milliseconds.
    #[arg(short = 'r', long, default_value_t = 100)]
    rate_ms: u64,

    /// Call timeout, in milliseconds.
    #[arg(short = 't', long, default_value_t = 1_000)]
    timeout_ms: u64,

    /// Call URI.
    #[arg(short = 'u', long, default_value = "test.delay")]
    uri: String,

    /// Wait duration for in-flight results after the run, in milliseconds.
    #[arg(short = 'w', long, default_value_t = 5_000)]
    wait_ms: u64,

    /// Metrics endpoint; derived from the server address when empty.
    #[arg(long, default_value = "")]
    vars_url: String,
}

#[derive(Default)]
struct Stats {
    calls: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    res: AtomicU64,
    exp: AtomicU64,
    starts: Mutex<HashMap<Uuid, Instant>>,
    latencies: Mutex<Vec<Duration>>,
}

impl Stats {
    fn started(&self, uuid: Uuid) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.starts.lock().unwrap().insert(uuid, Instant::now());
    }

    fn finished(&self, uuid: Uuid) {
        if let Some(start) = self.starts.lock().unwrap().remove(&uuid) {
            self.latencies.lock().unwrap().push(start.elapsed());
        }
    }
}

#[async_trait]
impl Handler for Stats {
    async fn handle(&self, msg: Incoming) {
        match msg {
            Incoming::Msg(Msg::Ack(ack)) if ack.payload.for_type == MsgType::CALL => {
                self.acks.fetch_add(1, Ordering::Relaxed);
            }
            Incoming::Msg(Msg::Nack(nack)) if nack.payload.for_type == MsgType::CALL => {
                self.nacks.fetch_add(1, Ordering::Relaxed);
                self.starts.lock().unwrap().remove(&nack.payload.for_);
            }
            Incoming::Msg(Msg::Res(res)) => {
                self.res.fetch_add(1, Ordering::Relaxed);
                self.finished(res.payload.for_);
            }
            Incoming::Exp(exp) => {
                self.exp.fetch_add(1, Ordering::Relaxed);
                self.finished(exp.payload.for_);
            }
            _ => {}
        }
    }
}

fn vars_url(args: &Args) -> String {
    if !args.vars_url.is_empty() {
        return args.vars_url.clone();
    }
    // ws://host:port/path -> http://host:port/debug/vars
    let http = args
        .addr
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1);
    let host_start = http.find("://").map(|i| i + 3).unwrap_or(0);
    match http[host_start..].find('/') {
        Some(i) => format!("{}/debug/vars", &http[..host_start + i]),
        None => format!("{http}/debug/vars"),
    }
}

async fn fetch_vars(url: &str) -> Option<HashMap<String, i64>> {
    let resp = reqwest::get(url).await.ok()?;
    resp.json().await.ok()
}

fn pctl(sorted: &[Duration], p: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = (p * (sorted.len() - 1)) / 100;
    sorted[idx]
}

async fn run_conn(args: Arc<Args>, stats: Arc<Stats>, deadline: Instant) {
    let client = match Client::dial(
        &args.addr,
        None,
        Arc::clone(&stats) as Arc<dyn Handler>,
        Options::default(),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("dial failed: {e}");
            return;
        }
    };

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.rate_ms.max(1)));
    while Instant::now() < deadline {
        ticker.tick().await;
        let uri = if args.num_uris > 0 {
            format!(
                "{}.{}",
                args.uri,
                rand::thread_rng().gen_range(0..args.num_uris)
            )
        } else {
            args.uri.clone()
        };
        match client.call(&uri, json!(args.payload.clone()), timeout).await {
            Ok(uuid) => stats.started(uuid),
            Err(_) => break,
        }
    }

    tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;
    client.close().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Arc::new(Args::parse());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if args.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    let metrics_url = vars_url(&args);
    let before = fetch_vars(&metrics_url).await;

    let stats = Arc::new(Stats::default());
    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);
    let run_start = Instant::now();

    let mut handles = Vec::with_capacity(args.conns);
    for _ in 0..args.conns {
        handles.push(tokio::spawn(run_conn(
            Arc::clone(&args),
            Arc::clone(&stats),
            deadline,
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }
    let actual = run_start.elapsed();

    let after = fetch_vars(&metrics_url).await;
    report(&args, &stats, actual, before, after);
    ExitCode::SUCCESS
}

fn report(
    args: &Args,
    stats: &Stats,
    actual: Duration,
    before: Option<HashMap<String, i64>>,
    after: Option<HashMap<String, i64>>,
) {
    let mut latencies = stats.latencies.lock().unwrap().clone();
    latencies.sort();
    let avg = if latencies.is_empty() {
        Duration::ZERO
    } else {
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    };

    println!("--- CONFIGURATION");
    println!();
    println!("Address:    {}", args.addr);
    println!("URI:        {} x {}", args.uri, args.num_uris);
    println!("Payload:    {}", args.payload);
    println!();
    println!("Connections: {}", args.conns);
    println!("Rate:        {:?}", Duration::from_millis(args.rate_ms));
    println!("Timeout:     {:?}", Duration::from_millis(args.timeout_ms));
    println!("Duration:    {:?}", Duration::from_millis(args.duration_ms));
    println!();
    println!("--- CLIENT STATISTICS");
    println!();
    println!("Actual Duration: {actual:?}");
    println!("Calls:           {}", stats.calls.load(Ordering::Relaxed));
    println!("Acks:            {}", stats.acks.load(Ordering::Relaxed));
    println!("Nacks:           {}", stats.nacks.load(Ordering::Relaxed));
    println!("Results:         {}", stats.res.load(Ordering::Relaxed));
    println!("Expired:         {}", stats.exp.load(Ordering::Relaxed));
    println!();
    println!("--- CLIENT LATENCIES");
    println!();
    println!("Minimum:         {:?}", pctl(&latencies, 0));
    println!("Maximum:         {:?}", pctl(&latencies, 100));
    println!("Average:         {avg:?}");
    println!("Median:          {:?}", pctl(&latencies, 50));
    println!("75th Percentile: {:?}", pctl(&latencies, 75));
    println!("90th Percentile: {:?}", pctl(&latencies, 90));
    println!("99th Percentile: {:?}", pctl(&latencies, 99));

    let (Some(before), Some(after)) = (before, after) else {
        println!();
        println!("(server statistics unavailable)");
        return;
    };

    println!();
    println!("--- SERVER STATISTICS");
    println!();
    println!("{:<20}{:<16}{:<16}Diff.", "Counter", "Before", "After");
    let mut names: Vec<&String> = after.keys().collect();
    names.sort();
    for name in names {
        let b = before.get(name).copied().unwrap_or(0);
        let a = after[name];
        println!("{:<20}{:<16}{:<16}{}", format!("{name}:"), b, a, a - b);
    }
}
