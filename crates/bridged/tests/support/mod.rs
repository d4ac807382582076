//! In-process fake debug peer for integration tests.
//!
//! A `FakePeer` serves a `/json/list` target list over plain HTTP on one
//! port and a control WebSocket on another. The socket answers
//! `Runtime.enable` by announcing its configured contexts; every other
//! method goes to a scripted responder.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Scripted Replies
// ============================================================================

/// How the peer answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error { code: i64, message: String },
    Silent,
    /// Sends `reply` after `after`, without holding up other requests
    Delayed { after: Duration, reply: Box<Reply> },
}

impl Reply {
    /// Wraps `self` so it is sent after `after`.
    pub fn delayed(self, after: Duration) -> Self {
        Reply::Delayed {
            after,
            reply: Box::new(self),
        }
    }
}

/// An evaluate result carrying `value`.
pub fn value(v: Value) -> Reply {
    Reply::Result(json!({ "result": { "type": "object", "value": v } }))
}

/// An evaluate result that threw.
pub fn exception(description: &str) -> Reply {
    Reply::Result(json!({
        "result": { "type": "object", "subtype": "error" },
        "exceptionDetails": {
            "text": "Uncaught",
            "exception": { "description": description }
        }
    }))
}

/// An evaluate result with no value.
pub fn undefined() -> Reply {
    Reply::Result(json!({ "result": { "type": "undefined" } }))
}

pub type Responder = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

/// Wraps a closure as a responder.
pub fn responder<F>(f: F) -> Responder
where
    F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Responder for `Runtime.evaluate` keyed on the context id.
pub fn evaluate_by_context<F>(f: F) -> Responder
where
    F: Fn(i64, &str) -> Reply + Send + Sync + 'static,
{
    responder(move |method, params| {
        if method != "Runtime.evaluate" {
            return Reply::Result(json!({}));
        }
        let ctx = params["contextId"].as_i64().unwrap_or(0);
        let expr = params["expression"].as_str().unwrap_or("");
        f(ctx, expr)
    })
}

// ============================================================================
// Fake Peer
// ============================================================================

/// Configuration of the single target a fake peer exposes.
pub struct PeerConfig {
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub contexts: Vec<i64>,
    pub responder: Responder,
    /// Fixed port for the target list, picked at random when unset
    pub http_port: Option<u16>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            target_type: "page".to_string(),
            title: "Editor".to_string(),
            url: "vscode-file://vscode-app/workbench/workbench.html".to_string(),
            contexts: vec![1],
            responder: responder(|_, _| undefined()),
            http_port: None,
        }
    }
}

#[derive(Debug, Clone)]
enum Control {
    Close,
    Event(Value),
}

struct PeerState {
    contexts: Vec<i64>,
    responder: Responder,
    requests: Mutex<Vec<Value>>,
    connections: AtomicUsize,
    open: AtomicUsize,
}

/// A running fake peer.
pub struct FakePeer {
    pub http_port: u16,
    pub ws_url: String,
    state: Arc<PeerState>,
    control: broadcast::Sender<Control>,
}

impl FakePeer {
    pub async fn start(config: PeerConfig) -> Self {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = ws_listener.local_addr().unwrap().port();
        let ws_url = format!("ws://127.0.0.1:{ws_port}/devtools/page/FAKE");

        let targets = json!([{
            "id": "FAKE",
            "type": config.target_type,
            "title": config.title,
            "url": config.url,
            "webSocketDebuggerUrl": ws_url,
        }]);
        let http_port = match config.http_port {
            Some(port) => serve_target_list_at(port, targets).await,
            None => serve_target_list(targets).await,
        };

        let state = Arc::new(PeerState {
            contexts: config.contexts,
            responder: config.responder,
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
        });
        let (control, _) = broadcast::channel(16);

        let accept_state = Arc::clone(&state);
        let accept_control = control.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = ws_listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                accept_state.open.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_socket(
                    ws,
                    Arc::clone(&accept_state),
                    accept_control.subscribe(),
                ));
            }
        });

        Self {
            http_port,
            ws_url,
            state,
            control,
        }
    }

    /// Total sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Sockets currently open.
    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Closes every open socket from the peer side.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Sends an unsolicited event on every open socket.
    pub fn emit(&self, method: &str, params: Value) {
        let _ = self
            .control
            .send(Control::Event(json!({ "method": method, "params": params })));
    }

    /// Waits until at least `n` sockets have been accepted.
    pub async fn wait_for_connections(&self, n: usize) {
        wait_until(|| self.connections() >= n).await;
    }
}

async fn serve_socket(
    ws: WebSocketStream<TcpStream>,
    state: Arc<PeerState>,
    mut control: broadcast::Receiver<Control>,
) {
    let (mut sink, mut stream) = ws.split();
    let (late_tx, mut late_rx) = mpsc::unbounded_channel::<Value>();

    loop {
        let mut out = Vec::new();

        tokio::select! {
            ctrl = control.recv() => match ctrl {
                Ok(Control::Event(event)) => out.push(event),
                Ok(Control::Close) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = sink.close().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            Some(frame) = late_rx.recv() => out.push(frame),
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    state.requests.lock().unwrap().push(request.clone());

                    let id = request["id"].clone();
                    let method = request["method"].as_str().unwrap_or("").to_string();

                    if method == "Runtime.enable" {
                        out.push(json!({ "id": id, "result": {} }));
                        for ctx in &state.contexts {
                            out.push(json!({
                                "method": "Runtime.executionContextCreated",
                                "params": { "context": { "id": ctx, "name": "", "origin": "vscode-file://vscode-app" } }
                            }));
                        }
                    } else {
                        let reply = (state.responder)(&method, &request["params"]);
                        schedule_reply(id, reply, &mut out, &late_tx);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }

        let mut failed = false;
        for frame in out {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
    }

    state.open.fetch_sub(1, Ordering::SeqCst);
}

/// Queues the frame for `reply`, now or after its delay.
fn schedule_reply(
    id: Value,
    reply: Reply,
    out: &mut Vec<Value>,
    late: &mpsc::UnboundedSender<Value>,
) {
    match reply {
        Reply::Result(result) => out.push(json!({ "id": id, "result": result })),
        Reply::Error { code, message } => out.push(json!({
            "id": id,
            "error": { "code": code, "message": message }
        })),
        Reply::Silent => {}
        Reply::Delayed { after, reply } => {
            let late = late.clone();
            tokio::spawn(async move {
                sleep(after).await;
                let mut frames = Vec::new();
                schedule_reply(id, *reply, &mut frames, &late);
                for frame in frames {
                    let _ = late.send(frame);
                }
            });
        }
    }
}

// ============================================================================
// Target List Server
// ============================================================================

/// Serves `targets` at `/json/list` on a fresh port and returns the port.
pub async fn serve_target_list(targets: Value) -> u16 {
    serve_target_list_at(0, targets).await
}

/// Serves `targets` at `/json/list` on `port` (0 for any) and returns the
/// bound port.
pub async fn serve_target_list_at(port: u16, targets: Value) -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(targets.to_string());

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }

                let head = String::from_utf8_lossy(&buf);
                let response = if head.starts_with("GET /json/list") {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    port
}

/// Returns a port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Polls `condition` until it holds, failing the test after `WAIT`.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {WAIT:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `fut`, failing the test after `WAIT`.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    timeout(WAIT, fut).await.expect("timed out")
}
