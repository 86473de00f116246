//! Client tests against a scripted websocket server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use juggler_client::{Client, Handler, Incoming, Options};
use juggler_wire::{Msg, MsgType, ResPayload};

#[derive(Clone, Copy)]
enum Behavior {
    /// ACK each call, then immediately send its result.
    AckThenRes,
    /// ACK each call, then send the result only after the delay.
    AckThenLateRes(Duration),
    /// NACK each call.
    NackCall,
    /// ACK everything without further replies.
    AckAll,
}

type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn send(ws: &mut ServerWs, m: &Msg) {
    ws.send(WsMessage::Text(m.encode().unwrap().into()))
        .await
        .unwrap();
}

fn echo_res(call: &juggler_wire::Call) -> Msg {
    Msg::new_res(ResPayload {
        conn_uuid: Uuid::new_v4(),
        msg_uuid: call.meta.uuid,
        uri: call.payload.uri.clone(),
        args: call.payload.args.clone(),
    })
}

async fn mock_server(behavior: Behavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &tokio_tungstenite::tungstenite::handshake::server::Request, mut response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            if let Some(proto) = req.headers().get("sec-websocket-protocol") {
                response.headers_mut().insert("sec-websocket-protocol", proto.clone());
            }
            Ok(response)
        })
        .await
        .unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            let WsMessage::Text(text) = frame else {
                continue;
            };
            let Ok(m) = Msg::decode_request(text.as_str(), &[]) else {
                continue;
            };

            match (behavior, &m) {
                (Behavior::AckThenRes, Msg::Call(call)) => {
                    send(&mut ws, &Msg::new_ack(&m)).await;
                    let res = echo_res(call);
                    send(&mut ws, &res).await;
                }
                (Behavior::AckThenLateRes(delay), Msg::Call(call)) => {
                    send(&mut ws, &Msg::new_ack(&m)).await;
                    tokio::time::sleep(delay).await;
                    let res = echo_res(call);
                    send(&mut ws, &res).await;
                }
                (Behavior::NackCall, Msg::Call(_)) => {
                    let nack = Msg::new_nack(&m, 500, Arc::new(std::io::Error::other("refused")));
                    send(&mut ws, &nack).await;
                }
                _ => send(&mut ws, &Msg::new_ack(&m)).await,
            }
        }
    });

    addr
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
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
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

async fn dial(addr: SocketAddr, recorder: &Arc<Recorder>, opts: Options) -> Client {
    Client::dial(
        &format!("ws://{addr}"),
        None,
        Arc::clone(recorder) as Arc<dyn Handler>,
        opts,
    )
    .await
    .unwrap()
}

fn is_exp_for(m: &Incoming, uuid: Uuid) -> bool {
    matches!(m, Incoming::Exp(exp) if exp.payload.for_ == uuid)
}

fn is_res_for(m: &Incoming, uuid: Uuid) -> bool {
    matches!(m, Incoming::Msg(Msg::Res(res)) if res.payload.for_ == uuid)
}

#[tokio::test]
async fn call_gets_ack_and_result() {
    let addr = mock_server(Behavior::AckThenRes).await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(addr, &recorder, Options::default()).await;

    let id = client
        .call("test.echo", json!("hi"), Duration::from_millis(500))
        .await
        .unwrap();

    recorder.wait_until(|m| is_res_for(m, id)).await;
    recorder
        .wait_until(|m| {
            matches!(m, Incoming::Msg(Msg::Ack(ack)) if ack.payload.for_ == id
                && ack.payload.for_type == MsgType::CALL)
        })
        .await;

    // no expiration once the result arrived
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(recorder.count(|m| is_exp_for(m, id)), 0);
}

#[tokio::test]
async fn timed_out_call_expires_exactly_once_and_late_result_is_dropped() {
    let addr = mock_server(Behavior::AckThenLateRes(Duration::from_millis(300))).await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(addr, &recorder, Options::default()).await;

    let id = client
        .call("test.delay", json!("250"), Duration::from_millis(100))
        .await
        .unwrap();

    recorder.wait_until(|m| is_exp_for(m, id)).await;

    // the late result arrives on the socket after the expiration, and is
    // dropped without reaching the handler
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(recorder.count(|m| is_res_for(m, id)), 0);
    assert_eq!(recorder.count(|m| is_exp_for(m, id)), 1);

    let exp = recorder
        .msgs
        .lock()
        .unwrap()
        .iter()
        .find_map(|m| match m {
            Incoming::Exp(exp) if exp.payload.for_ == id => Some(exp.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(exp.payload.uri, "test.delay");
    assert_eq!(exp.payload.args, json!("250"));
}

#[tokio::test]
async fn nacked_call_never_expires() {
    let addr = mock_server(Behavior::NackCall).await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(addr, &recorder, Options::default()).await;

    let id = client
        .call("test.echo", json!(1), Duration::from_millis(100))
        .await
        .unwrap();

    recorder
        .wait_until(|m| {
            matches!(m, Incoming::Msg(Msg::Nack(nack)) if nack.payload.for_ == id
                && nack.payload.code == 500)
        })
        .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(recorder.count(|m| is_exp_for(m, id)), 0);
}

#[tokio::test]
async fn sub_unsb_pub_are_acknowledged() {
    let addr = mock_server(Behavior::AckAll).await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(addr, &recorder, Options::default()).await;

    let sub_id = client.sub("c", false).await.unwrap();
    let unsb_id = client.unsb("c", false).await.unwrap();
    let pub_id = client.pub_("c", json!({"n": 1})).await.unwrap();

    for (id, typ) in [
        (sub_id, MsgType::SUB),
        (unsb_id, MsgType::UNSB),
        (pub_id, MsgType::PUB),
    ] {
        recorder
            .wait_until(|m| {
                matches!(m, Incoming::Msg(Msg::Ack(ack)) if ack.payload.for_ == id
                    && ack.payload.for_type == typ)
            })
            .await;
    }
}

#[tokio::test]
async fn exceeded_write_limit_latches_the_client_error() {
    let addr = mock_server(Behavior::AckAll).await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(
        addr,
        &recorder,
        Options {
            write_limit: 64,
            ..Options::default()
        },
    )
    .await;

    let err = client
        .call("test.echo", json!("x".repeat(1024)), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("write limit exceeded"), "{err}");

    // the client is now failed; further requests are refused with the same
    // error
    let err2 = client.sub("c", false).await.unwrap_err();
    assert!(err2.to_string().contains("write limit exceeded"), "{err2}");
    assert!(client.err().is_some());
}

#[tokio::test]
async fn close_latches_closed_error() {
    let addr = mock_server(Behavior::AckAll).await;
    let recorder = Arc::new(Recorder::default());
    let client = dial(addr, &recorder, Options::default()).await;

    let err = client.close().await.unwrap();
    assert!(matches!(*err, juggler_client::ClientError::Closed));
    assert!(client.call("u", json!(0), Duration::from_secs(1)).await.is_err());
}
