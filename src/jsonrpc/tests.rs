//! Unit tests for the JSON-RPC engine.
//!
//! The server is driven through a capturing responder; the client runs
//! over an in-memory transport that either loops payloads through a real
//! server or lets the test inject replies by hand.

use std::{
    sync::{
        Arc,
        Mutex,
        RwLock,
        mpsc,
    },
    time::Duration,
};

use bytes::Bytes;
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tracing_test::traced_test;

use super::*;
use crate::{
    client::{ClientError, ClientTransport, Incoming, MessageHandler},
    transport::{RequestHandler, Responder},
};

const WAIT: Duration = Duration::from_secs(5);

struct Capture(Mutex<mpsc::Sender<Bytes>>);

impl Responder for Capture {
    fn respond(&self, payload: Bytes) {
        let _ = self.0.lock().expect("capture lock").send(payload);
    }
}

fn echo(params: Params) -> Result<Value, RpcError> {
    params
        .arg(0, "text")
        .cloned()
        .ok_or_else(|| RpcError::InvalidParams("text is required".into()))
}

fn table() -> MethodTable {
    MethodTable::new()
        .method("echo", echo)
        .method("Host.echo", echo)
        .method("Host.ping", |_| Ok(json!(true)))
        .method("Host.explode", |_| panic!("boom"))
}

fn new_server() -> JsonRpcServer {
    let pool = WorkerPool::new(2, 16).expect("worker pool");
    JsonRpcServer::new(Arc::new(table()), Arc::new(pool))
}

#[fixture]
fn server() -> JsonRpcServer { new_server() }

/// Submit `payload` and return the decoded reply, if one arrives.
fn exchange(server: &JsonRpcServer, payload: &str, wait: Duration) -> Option<Value> {
    let (tx, rx) = mpsc::channel();
    server.handle_request(
        Bytes::copy_from_slice(payload.as_bytes()),
        Arc::new(Capture(Mutex::new(tx))),
    );
    rx.recv_timeout(wait)
        .ok()
        .map(|reply| serde_json::from_slice(&reply).expect("reply is JSON"))
}

#[rstest]
fn echo_returns_its_argument(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"{"jsonrpc":"2.0","method":"echo","params":["hello"],"id":1}"#,
        WAIT,
    )
    .expect("reply");
    assert_eq!(reply["result"], json!("hello"));
    assert_eq!(reply["id"], json!(1));
    assert!(reply.get("error").is_none());
}

#[rstest]
fn named_params_reach_the_method(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"{"jsonrpc":"2.0","method":"Host.echo","params":{"text":"hi"},"id":"a"}"#,
        WAIT,
    )
    .expect("reply");
    assert_eq!(reply["result"], json!("hi"));
    assert_eq!(reply["id"], json!("a"));
}

#[rstest]
fn missing_method_is_reported_by_name(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"{"jsonrpc":"2.0","method":"missing_method","id":7}"#,
        WAIT,
    )
    .expect("reply");
    assert_eq!(reply["error"]["code"], json!(error_codes::METHOD_NOT_FOUND));
    let message = reply["error"]["message"].as_str().expect("message");
    assert!(message.contains("missing_method"), "{message}");
    assert_eq!(reply["id"], json!(7));
}

#[rstest]
fn notifications_are_never_answered(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"{"jsonrpc":"2.0","method":"Host.ping"}"#,
        Duration::from_millis(200),
    );
    assert!(reply.is_none());

    let reply = exchange(
        &server,
        r#"[{"jsonrpc":"2.0","method":"Host.ping"},{"jsonrpc":"2.0","method":"nope"}]"#,
        Duration::from_millis(200),
    );
    assert!(reply.is_none());
}

#[rstest]
fn batch_replies_keep_request_order_and_skip_notifications(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"[
            {"jsonrpc":"2.0","method":"Host.echo","params":["first"],"id":1},
            {"jsonrpc":"2.0","method":"Host.ping"},
            {"jsonrpc":"2.0","method":"missing_method","id":2},
            {"jsonrpc":"2.0","method":"Host.echo","params":["third"],"id":3}
        ]"#,
        WAIT,
    )
    .expect("reply");
    let replies = reply.as_array().expect("batch reply is an array");
    let ids: Vec<&Value> = replies.iter().map(|r| &r["id"]).collect();
    assert_eq!(ids, [&json!(1), &json!(2), &json!(3)]);
    assert_eq!(replies[0]["result"], json!("first"));
    assert_eq!(replies[1]["error"]["code"], json!(error_codes::METHOD_NOT_FOUND));
    assert_eq!(replies[2]["result"], json!("third"));
}

#[rstest]
#[case::parse_error("{not json", error_codes::PARSE_ERROR, Value::Null)]
#[case::empty_batch("[]", error_codes::INVALID_REQUEST, Value::Null)]
#[case::missing_version(r#"{"method":"Host.ping","id":4}"#, error_codes::INVALID_REQUEST, json!(4))]
#[case::wrong_version(r#"{"jsonrpc":"1.0","method":"Host.ping","id":5}"#, error_codes::INVALID_REQUEST, json!(5))]
#[case::scalar_params(r#"{"jsonrpc":"2.0","method":"Host.ping","params":3,"id":6}"#, error_codes::INVALID_REQUEST, json!(6))]
fn malformed_requests_are_answered_with_errors(
    server: JsonRpcServer,
    #[case] payload: &str,
    #[case] code: i64,
    #[case] id: Value,
) {
    let reply = exchange(&server, payload, WAIT).expect("reply");
    assert_eq!(reply["error"]["code"], json!(code));
    assert_eq!(reply["id"], id);
    assert!(reply.get("result").is_none());
}

#[rstest]
fn null_id_is_a_request_not_a_notification(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"{"jsonrpc":"2.0","method":"Host.ping","id":null}"#,
        WAIT,
    )
    .expect("reply");
    assert_eq!(reply["result"], json!(true));
    assert_eq!(reply["id"], Value::Null);
}

#[rstest]
#[traced_test]
fn panicking_method_becomes_internal_error(server: JsonRpcServer) {
    let reply = exchange(
        &server,
        r#"{"jsonrpc":"2.0","method":"Host.explode","id":9}"#,
        WAIT,
    )
    .expect("reply");
    assert_eq!(reply["error"]["code"], json!(error_codes::INTERNAL_ERROR));
    logs_assert(|lines: &[&str]| {
        lines
            .iter()
            .find(|line| line.contains("RPC method panicked") && line.contains("boom"))
            .map(|_| ())
            .ok_or_else(|| "panic log not found".to_string())
    });
}

#[test]
fn exhausted_pool_is_reported_as_internal_error() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let bridge = MethodTable::new().method("Host.block", move |_| {
        let _ = release_rx.lock().expect("release lock").recv();
        Ok(Value::Null)
    });
    let pool = WorkerPool::new(1, 1).expect("worker pool");
    let server = JsonRpcServer::new(Arc::new(bridge), Arc::new(pool));

    let (tx, rx) = mpsc::channel();
    server.handle_request(
        Bytes::from_static(br#"{"jsonrpc":"2.0","method":"Host.block","id":1}"#),
        Arc::new(Capture(Mutex::new(tx.clone()))),
    );
    server.handle_request(
        Bytes::from_static(br#"{"jsonrpc":"2.0","method":"Host.block","id":2}"#),
        Arc::new(Capture(Mutex::new(tx))),
    );
    let rejected: Value = serde_json::from_slice(&rx.recv_timeout(WAIT).expect("rejection")).expect("json");
    assert_eq!(rejected["id"], json!(2));
    assert_eq!(rejected["error"]["code"], json!(error_codes::INTERNAL_ERROR));

    release_tx.send(()).expect("release");
    let finished: Value = serde_json::from_slice(&rx.recv_timeout(WAIT).expect("first reply")).expect("json");
    assert_eq!(finished["id"], json!(1));
}

/// In-memory transport. With a server attached every payload is answered
/// by it; without one the test feeds replies through [`Loopback::deliver`].
#[derive(Default)]
struct Loopback {
    server: Option<JsonRpcServer>,
    handler: RwLock<Option<MessageHandler>>,
    sent: Mutex<Vec<(Bytes, Option<String>)>>,
    subscribed: Mutex<Vec<String>>,
}

impl Loopback {
    fn deliver(&self, payload: &str, destination: Option<&str>) {
        let handler = self.handler.read().expect("handler lock").clone();
        if let Some(handler) = handler {
            handler(Incoming {
                payload: Bytes::copy_from_slice(payload.as_bytes()),
                destination: destination.map(str::to_owned),
            });
        }
    }

    fn sent(&self) -> Vec<(Bytes, Option<String>)> { self.sent.lock().expect("sent lock").clone() }
}

struct LoopbackResponder(Arc<Loopback>);

impl Responder for LoopbackResponder {
    fn respond(&self, payload: Bytes) {
        let text = String::from_utf8(payload.to_vec()).expect("utf8 reply");
        self.0.deliver(&text, None);
    }
}

#[derive(Clone)]
struct Shared(Arc<Loopback>);

impl ClientTransport for Shared {
    fn send(&self, payload: Bytes, destination: Option<&str>) -> Result<(), ClientError> {
        self.0
            .sent
            .lock()
            .expect("sent lock")
            .push((payload.clone(), destination.map(str::to_owned)));
        if let Some(server) = &self.0.server {
            server.handle_request(payload, Arc::new(LoopbackResponder(Arc::clone(&self.0))));
        }
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.0.handler.write().expect("handler lock") = Some(handler);
    }

    fn subscribe(&self, destination: &str) -> Result<(), ClientError> {
        self.0
            .subscribed
            .lock()
            .expect("subscribed lock")
            .push(destination.to_owned());
        Ok(())
    }

    fn unsubscribe(&self, destination: &str) -> Result<(), ClientError> {
        self.0
            .subscribed
            .lock()
            .expect("subscribed lock")
            .retain(|d| d != destination);
        Ok(())
    }

    fn close(&self) {}
}

fn manual_client() -> (JsonRpcClient, Arc<Loopback>) {
    let loopback = Arc::new(Loopback::default());
    (JsonRpcClient::new(Shared(Arc::clone(&loopback))), loopback)
}

fn params(value: Value) -> Option<Params> { Some(serde_json::from_value(value).expect("params")) }

#[test]
fn call_round_trips_through_a_server() {
    let loopback = Arc::new(Loopback {
        server: Some(new_server()),
        ..Loopback::default()
    });
    let client = JsonRpcClient::new(Shared(Arc::clone(&loopback)));
    let request = client.request("Host.echo", params(json!(["hello"])));
    let responses = client.call(vec![request], WAIT).expect("call");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].result, Some(json!("hello")));
    assert_eq!(responses[0].id, json!(1));
    assert_eq!(client.pending(), 0);
}

#[test]
fn batch_responses_are_correlated_whatever_the_wire_order() {
    let (client, loopback) = manual_client();
    let requests: Vec<Request> = (0..3)
        .map(|n| client.request("Host.echo", params(json!([n]))))
        .collect();
    let call = client.call_async(requests).expect("call");
    assert!(!call.is_done());

    let (payload, _) = loopback.sent().pop().expect("batch sent");
    let sent: Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(sent.as_array().map(Vec::len), Some(3));

    loopback.deliver(
        r#"[{"jsonrpc":"2.0","result":"c","id":3},{"jsonrpc":"2.0","result":"a","id":1}]"#,
        None,
    );
    assert!(!call.is_done());
    loopback.deliver(r#"{"jsonrpc":"2.0","result":"b","id":2}"#, None);

    let responses = call.wait(WAIT).expect("complete");
    let ids: Vec<Value> = responses.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, [json!(1), json!(2), json!(3)]);
    let results: Vec<Value> = responses.into_iter().map(|r| r.into_result().expect("ok")).collect();
    assert_eq!(results, [json!("a"), json!("b"), json!("c")]);
}

#[test]
fn notification_only_batch_completes_immediately() {
    let (client, loopback) = manual_client();
    let responses = client
        .call(
            vec![Request::notification("Host.ping", None)],
            Duration::ZERO,
        )
        .expect("notifications need no reply");
    assert!(responses.is_empty());
    assert_eq!(loopback.sent().len(), 1);
}

#[test]
#[traced_test]
fn timed_out_call_forgets_its_ids() {
    let (client, loopback) = manual_client();
    let request = client.request("Host.ping", None);
    let err = client
        .call(vec![request], Duration::from_millis(20))
        .expect_err("no reply");
    assert_eq!(err.code(), error_codes::NO_RESPONSE);
    assert_eq!(client.pending(), 0);

    loopback.deliver(r#"{"jsonrpc":"2.0","result":true,"id":1}"#, None);
    assert!(logs_contain("unmatched response id"));
}

#[test]
fn server_errors_surface_with_their_code() {
    let (client, loopback) = manual_client();
    let request = client.request("missing_method", None);
    let call = client.call_async(vec![request]).expect("call");
    loopback.deliver(
        r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"the method missing_method does not exist"},"id":1}"#,
        None,
    );
    let response = call.wait(WAIT).expect("reply").remove(0);
    let err = response.into_result().expect_err("error response");
    assert_eq!(err.code(), error_codes::METHOD_NOT_FOUND);
    assert!(err.to_string().contains("missing_method"));
}

#[test]
fn callback_fires_once_the_batch_completes() {
    let (client, loopback) = manual_client();
    let (tx, rx) = mpsc::channel();
    let request = client.request("Host.ping", None);
    client
        .call_cb(vec![request], move |responses| {
            let _ = tx.send(responses);
        })
        .expect("call");
    assert!(rx.try_recv().is_err());
    loopback.deliver(r#"{"jsonrpc":"2.0","result":true,"id":1}"#, None);
    let responses = rx.recv_timeout(WAIT).expect("callback");
    assert_eq!(responses[0].result, Some(json!(true)));
}

#[test]
#[traced_test]
fn dropped_call_forgets_its_ids() {
    let (client, loopback) = manual_client();
    let request = client.request("Host.ping", None);
    let call = client.call_async(vec![request]).expect("call");
    assert_eq!(client.pending(), 1);
    drop(call);
    assert_eq!(client.pending(), 0);

    loopback.deliver(r#"{"jsonrpc":"2.0","result":true,"id":1}"#, None);
    assert!(logs_contain("unmatched response id"));
}

#[test]
fn dropped_call_leaves_reused_ids_alone() {
    let (client, loopback) = manual_client();
    let first = client
        .call_async(vec![Request::new("Host.ping", None, 7)])
        .expect("first call");
    loopback.deliver(r#"{"jsonrpc":"2.0","result":true,"id":7}"#, None);
    assert!(first.is_done());

    let second = client
        .call_async(vec![Request::new("Host.ping", None, 7)])
        .expect("id is free again");
    drop(first);
    assert_eq!(client.pending(), 1);

    loopback.deliver(r#"{"jsonrpc":"2.0","result":false,"id":7}"#, None);
    let responses = second.wait(WAIT).expect("second reply");
    assert_eq!(responses[0].result, Some(json!(false)));
}

#[test]
fn callbacks_stay_pending_until_close() {
    let (client, loopback) = manual_client();
    let (tx, rx) = mpsc::channel::<Vec<Response>>();
    let request = client.request("Host.ping", None);
    client
        .call_cb(vec![request], move |responses| {
            let _ = tx.send(responses);
        })
        .expect("call");
    assert_eq!(client.pending(), 1);

    client.close();
    assert_eq!(client.pending(), 0);
    loopback.deliver(r#"{"jsonrpc":"2.0","result":true,"id":1}"#, None);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn duplicate_ids_are_rejected() {
    let (client, loopback) = manual_client();
    let requests = vec![
        Request::new("Host.ping", None, 5),
        Request::new("Host.ping", None, 5),
    ];
    let err = client.call_async(requests).expect_err("duplicate");
    assert_eq!(err.code(), error_codes::INVALID_REQUEST);
    assert_eq!(client.pending(), 0);
    assert!(loopback.sent().is_empty());
}

#[test]
fn events_reach_subscribers_until_unsubscribed() {
    let (client, loopback) = manual_client();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (all_tx, mut all_rx) = tokio::sync::mpsc::unbounded_channel();
    let id = client.subscribe("/topic/vm.status", tx).expect("subscribe");
    let all = client.subscribe(ALL_EVENTS, all_tx).expect("subscribe all");
    assert_eq!(
        *loopback.subscribed.lock().expect("lock"),
        vec!["/topic/vm.status".to_owned()]
    );

    loopback.deliver(
        r#"{"jsonrpc":"2.0","method":"VM.status","params":{"state":"up"}}"#,
        Some("/topic/vm.status"),
    );
    let event = rx.try_recv().expect("event").expect("not the sentinel");
    assert_eq!(event.method, "VM.status");
    assert_eq!(event.params, params(json!({"state": "up"})));
    assert!(all_rx.try_recv().expect("wildcard event").is_some());

    loopback.deliver(r#"{"jsonrpc":"2.0","method":"Host.stats"}"#, Some("/topic/other"));
    assert!(rx.try_recv().is_err());
    assert!(all_rx.try_recv().expect("wildcard event").is_some());

    assert!(client.unsubscribe(id).expect("unsubscribe"));
    assert_eq!(rx.try_recv().expect("sentinel"), None);
    assert!(loopback.subscribed.lock().expect("lock").is_empty());
    assert!(!client.unsubscribe(id).expect("second unsubscribe"));
    assert!(client.unsubscribe(all).expect("unsubscribe all"));
}

#[test]
fn events_without_destination_route_by_method() {
    let (client, loopback) = manual_client();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.subscribe("VM.status", tx).expect("subscribe");
    loopback.deliver(r#"{"jsonrpc":"2.0","method":"VM.status"}"#, None);
    assert_eq!(
        rx.try_recv().expect("event").map(|event| event.method),
        Some("VM.status".to_owned())
    );
}

#[test]
#[traced_test]
fn mixed_batches_are_dropped() {
    let (client, loopback) = manual_client();
    let request = client.request("Host.ping", None);
    let call = client.call_async(vec![request]).expect("call");
    loopback.deliver(
        r#"[{"jsonrpc":"2.0","result":true,"id":1},{"jsonrpc":"2.0","method":"VM.status"}]"#,
        None,
    );
    assert!(!call.is_done());
    assert!(logs_contain("dropping malformed message"));
}

struct RequireState;

impl EventSchema for RequireState {
    fn validate(&self, event_id: &str, params: &serde_json::Map<String, Value>) -> Result<(), RpcError> {
        if params.contains_key("state") {
            Ok(())
        } else {
            Err(RpcError::InvalidParams(format!("{event_id} needs state")))
        }
    }
}

#[test]
fn notify_validates_then_sends_to_the_destination() {
    let (client, loopback) = manual_client();
    let mut params = serde_json::Map::new();
    let err = client
        .notify("VM.status", "/topic/vm.status", &RequireState, params.clone())
        .expect_err("schema rejects");
    assert_eq!(err.code(), error_codes::INVALID_PARAMS);
    assert!(loopback.sent().is_empty());

    params.insert("state".into(), json!("up"));
    client
        .notify("VM.status", "/topic/vm.status", &RequireState, params)
        .expect("notify");
    let (payload, destination) = loopback.sent().pop().expect("sent");
    assert_eq!(destination.as_deref(), Some("/topic/vm.status"));
    let sent: Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(sent["method"], json!("VM.status"));
    assert!(sent.get("id").is_none());
}

#[test]
fn classify_rejects_objects_of_neither_shape() {
    assert!(classify(b"{\"jsonrpc\":\"2.0\",\"id\":1}").is_err());
    assert!(matches!(classify(b"[]"), Err(RpcError::InvalidRequest(_))));
    assert!(matches!(classify(b"nope"), Err(RpcError::ParseError(_))));
}
