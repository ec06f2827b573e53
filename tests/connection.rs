use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsp_jsonrpc::{
    error_codes, parse_message_from_slice, CancellationToken, Connection, ConnectionBuilder,
    ConnectionError, FrameReader, HandlerTable, Message, NotificationHandler, NotificationMode,
    ProtocolObserver, RequestId, ResponseError, CANCEL_REQUEST_METHOD,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// The far end of a connection, driven frame by frame.
struct Peer {
    frames: FrameReader<DuplexStream>,
    input: DuplexStream,
}

impl Peer {
    async fn send(&mut self, json: Value) {
        let body = serde_json::to_vec(&json).unwrap();
        self.input
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await
            .unwrap();
        self.input.write_all(&body).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.frames.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("stream closed");
        serde_json::from_slice(&frame).unwrap()
    }
}

fn scripted(builder: ConnectionBuilder) -> (Connection, Peer, JoinHandle<Result<(), ConnectionError>>) {
    let (conn_out, peer_in) = duplex(64 * 1024);
    let (peer_out, conn_in) = duplex(64 * 1024);
    let conn = builder.build(conn_out);
    let runner = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run(conn_in).await })
    };
    let peer = Peer {
        frames: FrameReader::new(peer_in),
        input: peer_out,
    };
    (conn, peer, runner)
}

/// Two connections talking to each other.
fn pair(left: ConnectionBuilder, right: ConnectionBuilder) -> (Connection, Connection) {
    let (left_out, right_in) = duplex(64 * 1024);
    let (right_out, left_in) = duplex(64 * 1024);
    let left = left.build(left_out);
    let right = right.build(right_out);
    {
        let left = left.clone();
        tokio::spawn(async move { left.run(left_in).await });
    }
    {
        let right = right.clone();
        tokio::spawn(async move { right.run(right_in).await });
    }
    (left, right)
}

fn collecting_errors() -> (ConnectionBuilder, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let builder = {
        let errors = errors.clone();
        Connection::builder().error_handler(move |e| errors.lock().push(e.to_string()))
    };
    (builder, errors)
}

fn echo_handlers() -> HandlerTable {
    HandlerTable::new().on_request("echo", |_, params| async move {
        let params = params.unwrap_or(Value::Null);
        let delay = params["delay"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, ResponseError>(params)
    })
}

#[tokio::test]
async fn test_server_and_client_roles_over_one_stream() {
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let handlers = {
        let on_note = events.clone();
        let on_hello = events.clone();
        HandlerTable::new()
            .on_notification("initialized", move |_| on_note.lock().push("initialized".into()))
            .on_request("hello", move |ctx, _| {
                let events = on_hello.clone();
                async move {
                    events.lock().push(format!("hello {}", ctx.id()));
                    Ok::<_, ResponseError>(json!({"hello": ctx.id()}))
                }
            })
            .on_request("tocancel", |ctx, _| async move {
                ctx.cancelled().await;
                Err::<Value, _>(ResponseError::request_cancelled())
            })
    };
    let (conn, mut peer, _runner) = scripted(Connection::builder().handlers(handlers));

    peer.send(json!({"jsonrpc": "2.0", "method": "initialized", "params": {}})).await;
    peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "hello"})).await;
    peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "hello"})).await;
    peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": "tocancel"})).await;
    peer.send(json!({"jsonrpc": "2.0", "method": CANCEL_REQUEST_METHOD, "params": {"id": 3}}))
        .await;

    let mut responses = HashMap::new();
    for _ in 0..3 {
        let response = peer.recv().await;
        let id = response["id"].as_i64().unwrap();
        assert!(responses.insert(id, response).is_none(), "duplicate response for {id}");
    }
    assert_eq!(responses[&1]["result"], json!({"hello": 1}));
    assert_eq!(responses[&2]["result"], json!({"hello": 2}));
    assert_eq!(responses[&3]["error"]["code"], error_codes::REQUEST_CANCELLED);
    assert!(responses[&3].get("result").is_none());
    assert_eq!(events.lock().first().map(String::as_str), Some("initialized"));

    // Outbound call with a token that is already cancelled: the request still
    // goes out, followed by a cancel notification, and the real answer wins.
    let cancel = CancellationToken::new();
    cancel.cancel();
    let call = {
        let conn = conn.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            conn.call("helloworld", Some(json!({"Field": true})), &cancel)
                .await
        })
    };
    let request = peer.recv().await;
    assert_eq!(request["method"], "helloworld");
    let notification = peer.recv().await;
    assert_eq!(notification["method"], CANCEL_REQUEST_METHOD);
    assert_eq!(notification["params"]["id"], request["id"]);

    // Firing the signal again sends nothing more.
    cancel.cancel();
    cancel.cancel();
    let extra = tokio::time::timeout(Duration::from_millis(200), peer.frames.next_frame()).await;
    assert!(extra.is_err(), "unexpected frame after repeated cancel: {extra:?}");

    peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"fakedata": 999}}))
        .await;
    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome, Ok(json!({"fakedata": 999})));
}

#[tokio::test]
async fn test_concurrent_calls_correlate_in_both_directions() {
    const CALLS: u64 = 20;
    let (left, right) = pair(
        Connection::builder().handlers(echo_handlers()),
        Connection::builder().handlers(echo_handlers()),
    );

    let mut tasks = Vec::new();
    for n in 0..CALLS {
        for (caller, side) in [(left.clone(), "left"), (right.clone(), "right")] {
            tasks.push(tokio::spawn(async move {
                // Later calls answer first.
                let params = json!({"n": n, "from": side, "delay": (CALLS - n) * 5});
                let outcome = caller
                    .call("echo", Some(params.clone()), &CancellationToken::new())
                    .await
                    .unwrap();
                assert_eq!(outcome, Ok(params));
            }));
        }
    }
    for task in tasks {
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_second_answer_for_same_id_is_fatal() {
    let (builder, errors) = collecting_errors();
    let (conn, mut peer, runner) = scripted(builder);

    let call = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call("once", None, &CancellationToken::new()).await })
    };
    let request = peer.recv().await;
    let answer = json!({"jsonrpc": "2.0", "id": request["id"], "result": 1});
    peer.send(answer.clone()).await;
    peer.send(answer).await;

    assert_eq!(call.await.unwrap().unwrap(), Ok(json!(1)));
    let result = runner.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::UnknownResponseId(_))));
    assert!(conn.is_closed());
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test]
async fn test_cancel_for_unknown_id_is_ignored() {
    let (builder, errors) = collecting_errors();
    let builder = builder.handlers(HandlerTable::new().on_request("ping", |_, _| async {
        Ok::<_, ResponseError>(json!("pong"))
    }));
    let (conn, mut peer, _runner) = scripted(builder);

    peer.send(json!({"jsonrpc": "2.0", "method": CANCEL_REQUEST_METHOD, "params": {"id": 42}}))
        .await;
    peer.send(json!({"jsonrpc": "2.0", "id": "p", "method": "ping"})).await;

    let response = peer.recv().await;
    assert_eq!(response, json!({"jsonrpc": "2.0", "id": "p", "result": "pong"}));
    assert!(!conn.is_closed());
    assert!(errors.lock().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let (builder, errors) = collecting_errors();
    let (conn, mut peer, runner) = scripted(builder);
    let call = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call("pending", None, &CancellationToken::new()).await })
    };
    let _ = peer.recv().await;

    peer.input.write_all(b"Content-Type: text\r\n\r\n{}").await.unwrap();

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Frame(_))));
    assert!(matches!(call.await.unwrap(), Err(ConnectionError::Closed)));
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test]
async fn test_frames_decode_back_to_back() {
    let (mut tx, rx) = duplex(1024);
    let request = br#"{"jsonrpc":"2.0","id":"1","method":"helloworld","params":{"Field":true}}"#;
    let response = br#"{"jsonrpc":"2.0","id":3,"error":{"code":1,"message":"error message"}}"#;
    let mut wire = Vec::new();
    wire.extend_from_slice(
        format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n",
            request.len()
        )
        .as_bytes(),
    );
    wire.extend_from_slice(request);
    wire.extend_from_slice(format!("Content-Length: {}\r\n\r\n", response.len()).as_bytes());
    wire.extend_from_slice(response);
    tx.write_all(&wire).await.unwrap();
    drop(tx);

    let mut frames = FrameReader::new(rx);
    let first = frames.next_frame().await.unwrap().unwrap();
    let second = frames.next_frame().await.unwrap().unwrap();
    assert!(frames.next_frame().await.unwrap().is_none());

    match parse_message_from_slice(&first).unwrap() {
        Message::Request(request) => {
            assert_eq!(request.id, RequestId::String("1".into()));
            assert_eq!(request.params, Some(json!({"Field": true})));
        }
        other => panic!("expected a request, got {other:?}"),
    }
    match parse_message_from_slice(&second).unwrap() {
        Message::Response(response) => {
            assert_eq!(response.id, RequestId::Number(3));
            assert_eq!(response.outcome, Err(ResponseError::new(1, "error message")));
        }
        other => panic!("expected a response, got {other:?}"),
    }
}

struct Forward(mpsc::UnboundedSender<(String, Option<Value>)>);

#[async_trait]
impl NotificationHandler for Forward {
    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let _ = self.0.send((method.to_string(), params));
    }
}

#[tokio::test]
async fn test_queued_notifications_keep_their_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (_conn, mut peer, _runner) = scripted(
        Connection::builder()
            .notification_handler(Forward(tx))
            .notification_mode(NotificationMode::Queued),
    );

    for n in 0..10 {
        peer.send(json!({"jsonrpc": "2.0", "method": "progress", "params": {"n": n}}))
            .await;
    }
    for n in 0..10 {
        let (method, params) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(method, "progress");
        assert_eq!(params, Some(json!({"n": n})));
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn seen(&self, event: &str) -> bool {
        self.0.lock().iter().any(|e| e == event)
    }
}

impl ProtocolObserver for Recorder {
    fn outgoing_request(&self, _: &RequestId, method: &str, _: Option<&Value>) {
        self.0.lock().push(format!("--> request {method}"));
    }
    fn incoming_request(&self, _: &RequestId, method: &str, _: Option<&Value>) {
        self.0.lock().push(format!("<-- request {method}"));
    }
    fn outgoing_response(&self, _: &RequestId, method: &str, _: &Result<Value, ResponseError>) {
        self.0.lock().push(format!("--> response {method}"));
    }
    fn incoming_response(&self, _: &RequestId, method: &str, _: &Result<Value, ResponseError>) {
        self.0.lock().push(format!("<-- response {method}"));
    }
    fn outgoing_notification(&self, method: &str, _: Option<&Value>) {
        self.0.lock().push(format!("--> notification {method}"));
    }
    fn incoming_cancel_request(&self, _: &RequestId) {
        self.0.lock().push("<-- cancel".into());
    }
    fn outgoing_cancel_request(&self, _: &RequestId) {
        self.0.lock().push("--> cancel".into());
    }
    fn incoming_data_delay(&self, _: Duration) {
        self.0.lock().push("read".into());
    }
    fn outgoing_data_delay(&self, _: Duration) {
        self.0.lock().push("write".into());
    }
}

#[tokio::test]
async fn test_observer_can_be_replaced_at_runtime() {
    let (conn, mut peer, _runner) = scripted(Connection::builder().handlers(echo_handlers()));
    let recorder = Recorder::default();
    conn.set_observer(recorder.clone());

    peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {}})).await;
    let _ = peer.recv().await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let call = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call("status", None, &cancel).await })
    };
    let request = peer.recv().await;
    let _ = peer.recv().await;
    peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": null})).await;
    assert_eq!(call.await.unwrap().unwrap(), Ok(Value::Null));

    for event in [
        "<-- request echo",
        "--> response echo",
        "--> request status",
        "--> cancel",
        "--> notification $/cancelRequest",
        "<-- response status",
        "read",
        "write",
    ] {
        assert!(recorder.seen(event), "missing observer event {event:?}");
    }
}

#[tokio::test]
async fn test_typed_lsp_requests_and_notifications() {
    use lsp_types::notification::LogMessage;
    use lsp_types::request::WorkspaceConfiguration;
    use lsp_types::{ConfigurationItem, ConfigurationParams, LogMessageParams, MessageType};

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = HandlerTable::new()
        .request::<WorkspaceConfiguration, _, _>(|_, params| async move {
            Ok::<_, ResponseError>(
                params
                    .items
                    .into_iter()
                    .map(|item| json!({"section": item.section}))
                    .collect::<Vec<_>>(),
            )
        })
        .notification::<LogMessage, _>(move |params| {
            let _ = tx.send(params.message);
        });
    let (server, _client) = pair(Connection::builder(), Connection::builder().handlers(client));

    let params = ConfigurationParams {
        items: vec![ConfigurationItem {
            scope_uri: None,
            section: Some("editor".into()),
        }],
    };
    let settings = server
        .send_request::<WorkspaceConfiguration>(params, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settings, vec![json!({"section": "editor"})]);

    let rejected = server
        .call("workspace/configuration", Some(json!(42)), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rejected.unwrap_err().code, error_codes::INVALID_PARAMS);

    server
        .send_notification::<LogMessage>(LogMessageParams {
            typ: MessageType::INFO,
            message: "indexing done".into(),
        })
        .await
        .unwrap();
    let message = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(message, "indexing done");
}
