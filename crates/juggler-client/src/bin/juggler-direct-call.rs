//! Make a single call to a juggler server and print what comes back
//! (ACK/NACK, then RES or EXP).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use juggler_client::{Client, Handler, Incoming, Options};
use juggler_wire::{Msg, MsgType};

#[derive(Debug, Parser)]
#[command(name = "juggler-direct-call", about = "One-shot juggler call")]
struct Args {
    /// Server address.
    #[arg(long, default_value = "ws://localhost:9000/ws")]
    addr: String,

    /// Call URI.
    #[arg(short = 'u', long, default_value = "test.echo")]
    uri: String,

    /// Call payload, parsed as JSON (falls back to a plain string).
    #[arg(short = 'p', long, default_value = "hello")]
    payload: String,

    /// Call timeout, in milliseconds.
    #[arg(short = 't', long, default_value_t = 5_000)]
    timeout_ms: u64,
}

struct Printer {
    done: mpsc::Sender<bool>,
}

#[async_trait]
impl Handler for Printer {
    async fn handle(&self, msg: Incoming) {
        match msg {
            Incoming::Msg(Msg::Ack(ack)) => {
                println!("ACK  for {} ({})", ack.payload.for_, ack.payload.for_type);
            }
            Incoming::Msg(Msg::Nack(nack)) => {
                println!(
                    "NACK for {} ({}): {} {}",
                    nack.payload.for_, nack.payload.for_type, nack.payload.code, nack.payload.msg
                );
                if nack.payload.for_type == MsgType::CALL {
                    let _ = self.done.send(false).await;
                }
            }
            Incoming::Msg(Msg::Res(res)) => {
                println!("RES  for {}: {}", res.payload.for_, res.payload.args);
                let _ = self.done.send(true).await;
            }
            Incoming::Exp(exp) => {
                println!("EXP  for {}: call expired", exp.payload.for_);
                let _ = self.done.send(false).await;
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let (done_tx, mut done_rx) = mpsc::channel(1);
    let handler = Arc::new(Printer { done: done_tx });

    let client = match Client::dial(&args.addr, None, handler, Options::default()).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("dial failed: {e}");
            return ExitCode::from(2);
        }
    };

    let args_value = serde_json::from_str(&args.payload)
        .unwrap_or(serde_json::Value::String(args.payload.clone()));
    let timeout = Duration::from_millis(args.timeout_ms);
    let uuid = match client.call(&args.uri, args_value, timeout).await {
        Ok(uuid) => uuid,
        Err(e) => {
            eprintln!("call failed: {e}");
            return ExitCode::from(2);
        }
    };
    println!("CALL {} {}", uuid, args.uri);

    let ok = done_rx.recv().await.unwrap_or(false);
    client.close().await;
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
