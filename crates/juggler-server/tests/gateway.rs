//! End-to-end gateway tests: a real axum server and websocket client, with
//! the broker mocked out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use juggler_broker::{
    BrokerError, CallerBroker, EventsStream, PubSubBroker, PubSubCtl, PubSubSession,
    ResultsStream, StreamFeeder, Vars,
};
use juggler_server::{router, Server};
use juggler_wire::{CallPayload, EvntPayload, Msg, MsgType, PubPayload, ResPayload};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct MockBroker {
    calls: Mutex<Vec<(CallPayload, Duration)>>,
    fail_calls: AtomicBool,
    pubs: Mutex<Vec<(String, PubPayload)>>,
    subs: Arc<Mutex<Vec<(String, bool, bool)>>>,
    res_feeders: Mutex<Vec<StreamFeeder<ResPayload>>>,
    evt_feeders: Mutex<Vec<StreamFeeder<EvntPayload>>>,
}

impl MockBroker {
    fn push_result(&self, rp: ResPayload) {
        let feeders = self.res_feeders.lock().unwrap();
        let tx = feeders.last().expect("a results stream exists").tx.clone();
        tokio::spawn(async move {
            tx.send(rp).await.unwrap();
        });
    }

    fn push_event(&self, ep: EvntPayload) {
        let feeders = self.evt_feeders.lock().unwrap();
        let tx = feeders.last().expect("an events stream exists").tx.clone();
        tokio::spawn(async move {
            tx.send(ep).await.unwrap();
        });
    }
}

#[async_trait]
impl CallerBroker for MockBroker {
    async fn call(&self, cp: &CallPayload, timeout: Duration) -> Result<(), BrokerError> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("caller broker"));
        }
        self.calls.lock().unwrap().push((cp.clone(), timeout));
        Ok(())
    }

    async fn results_conn(&self, _conn_uuid: Uuid) -> Result<ResultsStream, BrokerError> {
        let (stream, feeder) = ResultsStream::pair(8);
        self.res_feeders.lock().unwrap().push(feeder);
        Ok(stream)
    }
}

#[async_trait]
impl PubSubBroker for MockBroker {
    async fn publish(&self, channel: &str, pp: &PubPayload) -> Result<(), BrokerError> {
        self.pubs.lock().unwrap().push((channel.to_string(), pp.clone()));
        Ok(())
    }

    async fn pubsub_conn(&self) -> Result<PubSubSession, BrokerError> {
        let (events, feeder) = EventsStream::pair(8);
        self.evt_feeders.lock().unwrap().push(feeder);
        Ok(PubSubSession {
            ctl: Box::new(MockCtl {
                subs: Arc::clone(&self.subs),
            }),
            events,
        })
    }
}

struct MockCtl {
    subs: Arc<Mutex<Vec<(String, bool, bool)>>>,
}

#[async_trait]
impl PubSubCtl for MockCtl {
    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError> {
        self.subs.lock().unwrap().push((channel.to_string(), pattern, true));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError> {
        self.subs.lock().unwrap().push((channel.to_string(), pattern, false));
        Ok(())
    }
}

async fn start_server(configure: impl FnOnce(&mut Server)) -> (SocketAddr, Arc<MockBroker>, Arc<Vars>) {
    let broker = Arc::new(MockBroker::default());
    let vars = Arc::new(Vars::new());
    let mut server = Server::new(broker.clone(), broker.clone());
    server.vars = Some(vars.clone());
    configure(&mut server);

    let app = router(Arc::new(server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, broker, vars)
}

async fn connect(addr: SocketAddr, subprotocol: Option<&str>, allowed: Option<&str>) -> Ws {
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    if let Some(proto) = subprotocol {
        req.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(proto).unwrap(),
        );
    }
    if let Some(allowed) = allowed {
        req.headers_mut().insert(
            "juggler-allowed-messages",
            HeaderValue::from_str(allowed).unwrap(),
        );
    }
    let (ws, _resp) = tokio_tungstenite::connect_async(req).await.unwrap();
    ws
}

async fn send_msg(ws: &mut Ws, m: &Msg) {
    ws.send(WsMessage::Text(m.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn recv_msg(ws: &mut Ws) -> Msg {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            WsMessage::Text(text) => return Msg::decode(text.as_str()).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// The stream ends (close frame or drop) before the timeout.
async fn expect_closed(ws: &mut Ws) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(None) => return,
            Ok(Some(Ok(WsMessage::Close(_)))) => return,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => return,
            Err(_) => panic!("connection still open"),
        }
    }
}

#[tokio::test]
async fn call_is_acked_then_resolved() {
    let (addr, broker, _) = start_server(|_| {}).await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let call = Msg::new_call("test.echo", json!("hi"), Duration::from_secs(1)).unwrap();
    send_msg(&mut ws, &call).await;

    let Msg::Ack(ack) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };
    assert_eq!(ack.payload.for_, call.uuid());
    assert_eq!(ack.payload.for_type, MsgType::CALL);
    assert_eq!(ack.payload.uri.as_deref(), Some("test.echo"));

    // the broker recorded the call with its timeout
    let (cp, timeout) = broker.calls.lock().unwrap().last().cloned().unwrap();
    assert_eq!(cp.msg_uuid, call.uuid());
    assert_eq!(timeout, Duration::from_secs(1));

    // a result arriving on the result queue flows back as RES
    broker.push_result(ResPayload {
        conn_uuid: cp.conn_uuid,
        msg_uuid: cp.msg_uuid,
        uri: cp.uri.clone(),
        args: json!("hi"),
    });
    let Msg::Res(res) = recv_msg(&mut ws).await else {
        panic!("expected RES");
    };
    assert_eq!(res.payload.for_, call.uuid());
    assert_eq!(res.payload.args, json!("hi"));
}

#[tokio::test]
async fn failed_call_is_nacked() {
    let (addr, broker, _) = start_server(|_| {}).await;
    broker.fail_calls.store(true, Ordering::SeqCst);
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let call = Msg::new_call("test.echo", json!(1), Duration::from_secs(1)).unwrap();
    send_msg(&mut ws, &call).await;

    let Msg::Nack(nack) = recv_msg(&mut ws).await else {
        panic!("expected NACK");
    };
    assert_eq!(nack.payload.for_, call.uuid());
    assert_eq!(nack.payload.code, 500);
    assert!(nack.payload.err.is_none());
    assert!(!nack.payload.msg.is_empty());
}

#[tokio::test]
async fn pub_is_acked_and_published() {
    let (addr, broker, _) = start_server(|_| {}).await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let pub_ = Msg::new_pub("news", json!({"n": 1})).unwrap();
    send_msg(&mut ws, &pub_).await;

    let Msg::Ack(ack) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };
    assert_eq!(ack.payload.channel.as_deref(), Some("news"));

    let (channel, pp) = broker.pubs.lock().unwrap().last().cloned().unwrap();
    assert_eq!(channel, "news");
    assert_eq!(pp.msg_uuid, pub_.uuid());
}

#[tokio::test]
async fn sub_is_acked_and_events_flow() {
    let (addr, broker, _) = start_server(|_| {}).await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let sub = Msg::new_sub("c", false);
    send_msg(&mut ws, &sub).await;
    let Msg::Ack(_) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };
    assert_eq!(
        broker.subs.lock().unwrap().last().cloned().unwrap(),
        ("c".to_string(), false, true)
    );

    let pub_uuid = Uuid::new_v4();
    broker.push_event(EvntPayload {
        msg_uuid: pub_uuid,
        channel: "c".into(),
        pattern: String::new(),
        args: json!("payload"),
    });
    let Msg::Evnt(evnt) = recv_msg(&mut ws).await else {
        panic!("expected EVNT");
    };
    assert_eq!(evnt.payload.for_, pub_uuid);
    assert_eq!(evnt.payload.channel, "c");
    assert_eq!(evnt.payload.pattern, "");
}

#[tokio::test]
async fn allowed_messages_restrict_the_connection() {
    let (addr, broker, _) = start_server(|_| {}).await;
    let mut ws = connect(addr, Some("juggler.0"), Some("call, pub")).await;

    // allowed messages still work
    let call = Msg::new_call("test.echo", json!(0), Duration::from_secs(1)).unwrap();
    send_msg(&mut ws, &call).await;
    let Msg::Ack(_) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };

    // a disallowed SUB closes the connection
    send_msg(&mut ws, &Msg::new_sub("c", false)).await;
    expect_closed(&mut ws).await;

    // the pubsub handle was never created for this connection
    assert!(broker.evt_feeders.lock().unwrap().is_empty());
}

#[tokio::test]
async fn oversized_write_produces_nack_599() {
    let (addr, broker, vars) = start_server(|s| {
        s.write_limit = 512;
    })
    .await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let call = Msg::new_call("test.big", json!(0), Duration::from_secs(5)).unwrap();
    send_msg(&mut ws, &call).await;
    let Msg::Ack(_) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };

    let cp = broker.calls.lock().unwrap().last().cloned().unwrap().0;
    broker.push_result(ResPayload {
        conn_uuid: cp.conn_uuid,
        msg_uuid: cp.msg_uuid,
        uri: cp.uri.clone(),
        args: json!("x".repeat(4096)),
    });

    let Msg::Nack(nack) = recv_msg(&mut ws).await else {
        panic!("expected NACK(599)");
    };
    assert_eq!(nack.payload.code, 599);
    assert_eq!(nack.payload.for_type, MsgType::RES);
    assert_eq!(vars.get("WriteLimitExceeded"), 1);
}

#[tokio::test]
async fn binary_frames_close_the_connection() {
    let (addr, _, _) = start_server(|_| {}).await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    ws.send(WsMessage::Binary(vec![1, 2, 3].into())).await.unwrap();
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn unsupported_subprotocol_is_dropped() {
    let (addr, _, _) = start_server(|_| {}).await;
    // no subprotocol offered at all: upgrade succeeds but the gateway drops
    // the connection immediately
    let mut ws = connect(addr, None, None).await;
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn conn_counters_move() {
    let (addr, _, vars) = start_server(|_| {}).await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let call = Msg::new_call("test.echo", json!(0), Duration::from_secs(1)).unwrap();
    send_msg(&mut ws, &call).await;
    let _ack = recv_msg(&mut ws).await;

    assert_eq!(vars.get("TotalConns"), 1);
    assert_eq!(vars.get("MsgsCALL"), 1);
    assert_eq!(vars.get("MsgsACK"), 1);
    assert!(vars.get("MsgsRead") >= 1);
    assert!(vars.get("MsgsWrite") >= 1);
}

struct PanicOn {
    uri: &'static str,
}

#[async_trait]
impl juggler_server::Handler for PanicOn {
    async fn handle(&self, conn: &Arc<juggler_server::Conn>, msg: Msg) {
        if let Msg::Call(call) = &msg {
            if call.payload.uri == self.uri {
                panic!("called panic URI");
            }
        }
        juggler_server::process_msg(conn, msg).await;
    }
}

#[tokio::test]
async fn handler_panic_is_recovered_and_closes_the_connection() {
    let (addr, _, vars) = start_server(|s| {
        s.handler = Some(Arc::new(juggler_server::PanicRecover::new(Arc::new(
            PanicOn { uri: "test.panic" },
        ))));
    })
    .await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    // a regular call still works through the wrapped handler
    let call = Msg::new_call("test.echo", json!(0), Duration::from_secs(1)).unwrap();
    send_msg(&mut ws, &call).await;
    let Msg::Ack(_) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };

    send_msg(
        &mut ws,
        &Msg::new_call("test.panic", json!(0), Duration::from_secs(1)).unwrap(),
    )
    .await;
    expect_closed(&mut ws).await;
    assert_eq!(vars.get("RecoveredPanics"), 1);
}

struct Tag {
    order: Arc<Mutex<Vec<&'static str>>>,
    tag: &'static str,
}

#[async_trait]
impl juggler_server::Handler for Tag {
    async fn handle(&self, _conn: &Arc<juggler_server::Conn>, _msg: Msg) {
        self.order.lock().unwrap().push(self.tag);
    }
}

#[tokio::test]
async fn chain_runs_handlers_in_order() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let (addr, _, _) = start_server(|s| {
        s.handler = Some(Arc::new(juggler_server::Chain::new(vec![
            Arc::new(Tag {
                order: Arc::clone(&order),
                tag: "first",
            }),
            Arc::new(Tag {
                order: Arc::clone(&order),
                tag: "second",
            }),
            Arc::new(juggler_server::ProcessMsg),
        ])));
    })
    .await;
    let mut ws = connect(addr, Some("juggler.0"), None).await;

    let call = Msg::new_call("test.echo", json!(0), Duration::from_secs(1)).unwrap();
    send_msg(&mut ws, &call).await;
    let Msg::Ack(_) = recv_msg(&mut ws).await else {
        panic!("expected ACK");
    };

    // both tags saw the CALL before the processor acknowledged it
    let order = order.lock().unwrap();
    assert_eq!(&order[..2], &["first", "second"]);
}
