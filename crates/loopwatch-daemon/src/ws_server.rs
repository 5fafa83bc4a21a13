use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use loopwatch_core::ServerMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::handler::handle_text;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Outbound};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Upgrade callback: only local pages may open a socket.
///
/// Viewers are the desktop shell (`tauri://localhost`), a dev server on
/// `http://localhost` or `http://127.0.0.1` with any port, `file://` pages
/// (which send `null`) and non-browser tools that send no `Origin` at all.
/// Anything else gets a 403 before the handshake completes.
fn validate_origin(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    let Some(origin) = req.headers().get("origin") else {
        return Ok(resp);
    };
    let origin_str = origin.to_str().unwrap_or("");
    if origin_allowed(origin_str) {
        return Ok(resp);
    }
    tracing::warn!(origin = %origin_str, "ws: rejected connection from disallowed origin");
    let mut err_resp = ErrorResponse::new(Some("Origin not allowed".into()));
    *err_resp.status_mut() = http::StatusCode::FORBIDDEN;
    Err(err_resp)
}

/// Exact host match; `http://localhost.example.com` is a remote origin.
fn origin_allowed(origin: &str) -> bool {
    if origin == "null" {
        return true;
    }
    let Ok(uri) = origin.parse::<http::Uri>() else {
        return false;
    };
    matches!(
        (uri.scheme_str(), uri.host()),
        (Some("tauri"), Some("localhost")) | (Some("http"), Some("localhost" | "127.0.0.1"))
    )
}

/// Default maximum number of concurrent WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Frames that may queue for one connection before broadcasts to it are
/// dropped.
const OUTBOUND_CAPACITY: usize = 256;

/// How long a terminated connection may take to accept its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket front of the connection hub. Each accepted client is registered
/// in the shared [`ConnectionRegistry`] for its lifetime.
pub struct WsServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    max_connections: usize,
}

impl WsServer {
    pub fn new(addr: SocketAddr, registry: Arc<ConnectionRegistry>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            registry,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Set the maximum number of concurrent WebSocket connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Bind, accept connections, and spawn per-client handlers until the
    /// cancellation token fires.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, max_connections = self.max_connections, "ws server listening");
        self.serve(listener).await
    }

    /// Bind to the configured address and return the actual local address.
    /// Useful when binding to port 0.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_connections = self.max_connections, "ws server bound");
        Ok((listener, local_addr))
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    tracing::warn!(
                                        peer = %peer,
                                        max = self.max_connections,
                                        "ws: connection limit reached, rejecting"
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };
                            tracing::debug!(peer = %peer, "ws: TCP connection accepted");
                            let registry = Arc::clone(&self.registry);
                            let cancel = self.cancel.child_token();
                            tokio::spawn(async move {
                                let _permit = permit;
                                match tokio_tungstenite::accept_hdr_async(stream, validate_origin).await {
                                    Ok(ws_stream) => {
                                        if let Err(e) = handle_ws_client(ws_stream, registry, cancel).await {
                                            tracing::debug!(peer = %peer, error = %e, "ws client handler finished with error");
                                        }
                                    }
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "ws handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "ws: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("ws server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Owns one client for its whole life: registers it, pumps frames both ways
/// and runs the disconnect cleanup exactly once on the way out, whatever
/// ended the connection.
async fn handle_ws_client(
    ws_stream: WebSocketStream<TcpStream>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let id = registry.connect(ConnectionHandle::new(out_tx, cancel.clone()), Instant::now());

    tracing::debug!(conn_id = %id, "ws client connected");

    let result = pump_client(id, &registry, &mut ws_tx, &mut ws_rx, &mut out_rx, &cancel).await;

    if registry.disconnect(id) {
        tracing::debug!(conn_id = %id, "ws client cleaned up");
    }
    result
}

async fn pump_client(
    id: ConnectionId,
    registry: &ConnectionRegistry,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    out_rx: &mut mpsc::Receiver<Outbound>,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    loop {
        let frame = tokio::select! {
            // --- incoming WebSocket message ---
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %id, error = %e, "ws read error, dropping client");
                        return Err(e.into());
                    }
                    None => {
                        tracing::debug!(conn_id = %id, "ws client disconnected (stream ended)");
                        return Ok(());
                    }
                };

                match msg {
                    Message::Text(text) => {
                        let reply = handle_text(registry, id, &text, Instant::now());
                        Message::Text(reply.to_json()?)
                    }
                    Message::Ping(data) => {
                        registry.mark_alive(id, Instant::now());
                        Message::Pong(data)
                    }
                    Message::Pong(_) => {
                        registry.mark_alive(id, Instant::now());
                        continue;
                    }
                    Message::Binary(_) => {
                        let reply = ServerMessage::error("binary frames are not supported");
                        Message::Text(reply.to_json()?)
                    }
                    Message::Close(_) => {
                        tracing::debug!(conn_id = %id, "ws client sent close frame");
                        return Ok(());
                    }
                    Message::Frame(_) => continue,
                }
            }

            // --- queued broadcasts and probes ---
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Text(text)) => Message::Text(text),
                    Some(Outbound::Ping) => Message::Ping(Vec::new()),
                    None => return Ok(()),
                }
            }

            // --- terminated by heartbeat or server shutdown ---
            _ = cancel.cancelled() => {
                tracing::debug!(conn_id = %id, "ws client handler: cancelled");
                let _ = tokio::time::timeout(CLOSE_GRACE, ws_tx.send(Message::Close(None))).await;
                return Ok(());
            }
        };

        // A peer that stopped reading stalls the write once its TCP window
        // fills; termination must still free the socket and the permit.
        tokio::select! {
            sent = ws_tx.send(frame) => sent?,
            _ = cancel.cancelled() => {
                tracing::debug!(conn_id = %id, "ws client handler: cancelled during write");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChangeBus, WatchNotification};
    use crate::heartbeat::run_heartbeat;
    use crate::router::run_router;
    use loopwatch_core::{ChangeEvent, ChangeKind, FileType};

    type ClientWs = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        bus: ChangeBus,
        cancel: CancellationToken,
        _handle: tokio::task::JoinHandle<std::io::Result<()>>,
    }

    async fn start_test_server(max_connections: Option<usize>, heartbeat: Option<Duration>) -> TestServer {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = ChangeBus::new();
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        tokio::spawn(run_router(bus.subscribe(), Arc::clone(&registry), cancel.clone()));
        if let Some(every) = heartbeat {
            tokio::spawn(run_heartbeat(Arc::clone(&registry), every, every, cancel.clone()));
        }

        let mut server = WsServer::new(addr, Arc::clone(&registry), cancel.clone());
        if let Some(max) = max_connections {
            server = server.with_max_connections(max);
        }
        let (listener, local_addr) = server.bind().await.unwrap();
        let handle = tokio::spawn(async move { server.serve(listener).await });
        TestServer {
            addr: local_addr,
            registry,
            bus,
            cancel,
            _handle: handle,
        }
    }

    impl TestServer {
        fn ws_url(&self) -> String {
            format!("ws://127.0.0.1:{}", self.addr.port())
        }

        async fn connect(&self) -> ClientWs {
            let (ws, _) = tokio_tungstenite::connect_async(&self.ws_url()).await.unwrap();
            ws
        }

        async fn connect_with_origin(&self, origin: &str) -> Result<ClientWs, tokio_tungstenite::tungstenite::Error> {
            let mut req = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
                &self.ws_url(),
            )
            .unwrap();
            req.headers_mut().insert("Origin", origin.parse().unwrap());
            let (ws, _) = tokio_tungstenite::connect_async(req).await?;
            Ok(ws)
        }

        async fn wait_for_connections(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(3), async {
                while self.registry.len() != n {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("registry never reached {n} connections"));
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn send_json(ws: &mut ClientWs, value: serde_json::Value) -> serde_json::Value {
        ws.send(Message::Text(value.to_string())).await.unwrap();
        recv_json(ws).await
    }

    async fn recv_json(ws: &mut ClientWs) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timeout waiting for message")
                .expect("stream ended")
                .expect("read error");
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    fn change(project_id: &str) -> ChangeEvent {
        ChangeEvent {
            project_id: project_id.into(),
            file_type: FileType::Prd,
            path: ".loop/prd.json".into(),
            kind: ChangeKind::Change,
        }
    }

    // -----------------------------------------------------------------------
    // Unit tests
    // -----------------------------------------------------------------------

    #[test]
    fn ws_server_can_be_constructed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = WsServer::new(addr, registry, CancellationToken::new());
        assert_eq!(server.addr, addr);
        assert_eq!(server.max_connections, DEFAULT_MAX_CONNECTIONS);

        let server = server.with_max_connections(128);
        assert_eq!(server.max_connections, 128);
    }

    #[tokio::test]
    async fn cancel_token_stops_server() {
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = WsServer::new(addr, registry, cancel.clone());

        let handle = tokio::spawn(async move { server.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "server should have stopped within timeout");
        let inner = result.unwrap().unwrap();
        assert!(inner.is_ok(), "server run should return Ok on cancellation");
    }

    fn upgrade_response() -> Response {
        http::Response::builder()
            .status(http::StatusCode::SWITCHING_PROTOCOLS)
            .body(())
            .unwrap()
    }

    #[test]
    fn validate_origin_allows_local_origins() {
        for origin in ["tauri://localhost", "http://localhost:3000", "http://127.0.0.1:9780", "null"] {
            let req = http::Request::builder().header("origin", origin).body(()).unwrap();
            assert!(validate_origin(&req, upgrade_response()).is_ok(), "{origin}");
        }
        let req = http::Request::builder().body(()).unwrap();
        assert!(validate_origin(&req, upgrade_response()).is_ok());
    }

    #[test]
    fn validate_origin_rejects_remote() {
        for origin in [
            "https://evil.example.com",
            "http://localhost.evil.example",
            "http://127.0.0.1.evil.example",
            "http://evil.example/http://localhost",
            "tauri://evil.example",
            "not a uri",
        ] {
            let req = http::Request::builder().header("origin", origin).body(()).unwrap();
            let err_resp = validate_origin(&req, upgrade_response()).unwrap_err();
            assert_eq!(err_resp.status(), http::StatusCode::FORBIDDEN, "{origin}");
        }
    }

    // -----------------------------------------------------------------------
    // Integration tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn subscribe_over_ws_returns_full_list() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect().await;

        let resp = send_json(&mut ws, serde_json::json!({"type": "subscribe", "projectIds": ["p2"]})).await;
        assert_eq!(resp, serde_json::json!({"type": "subscribed", "projectIds": ["p2"]}));

        let resp = send_json(&mut ws, serde_json::json!({"type": "subscribe", "projectIds": ["p1", "p2"]})).await;
        assert_eq!(resp["projectIds"], serde_json::json!(["p1", "p2"]));
    }

    #[tokio::test]
    async fn malformed_subscribe_gets_one_error_and_keeps_state() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect().await;

        send_json(&mut ws, serde_json::json!({"type": "subscribe", "projectIds": ["p1"]})).await;

        let resp = send_json(&mut ws, serde_json::json!({"type": "subscribe", "projectIds": "oops"})).await;
        assert_eq!(resp["type"], "error");
        assert!(resp["message"].as_str().unwrap().contains("subscribe"));

        // The very next frame answers this request, so only one error was sent.
        let resp = send_json(&mut ws, serde_json::json!({"type": "subscribe", "projectIds": []})).await;
        assert_eq!(resp, serde_json::json!({"type": "subscribed", "projectIds": ["p1"]}));
    }

    #[tokio::test]
    async fn invalid_json_and_unknown_type_return_errors() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect().await;

        ws.send(Message::Text("not valid json".into())).await.unwrap();
        let resp = recv_json(&mut ws).await;
        assert_eq!(resp["type"], "error");
        assert!(resp["message"].as_str().unwrap().contains("invalid JSON"));

        let resp = send_json(&mut ws, serde_json::json!({"type": "launch"})).await;
        assert_eq!(resp["type"], "error");
        assert!(resp["message"].as_str().unwrap().contains("launch"));

        // Connection is still usable.
        let resp = send_json(&mut ws, serde_json::json!({"type": "ping"})).await;
        assert_eq!(resp, serde_json::json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn change_reaches_only_remaining_subscriber() {
        let server = start_test_server(None, None).await;
        let mut a = server.connect().await;
        let mut b = server.connect().await;

        send_json(&mut a, serde_json::json!({"type": "subscribe", "projectIds": ["p1"]})).await;
        send_json(&mut b, serde_json::json!({"type": "subscribe", "projectIds": ["p1"]})).await;
        let resp = send_json(&mut a, serde_json::json!({"type": "unsubscribe", "projectIds": ["p1"]})).await;
        assert_eq!(resp, serde_json::json!({"type": "unsubscribed", "projectIds": ["p1"]}));

        server.bus.publish(WatchNotification::Change(change("p1")));

        let notif = recv_json(&mut b).await;
        assert_eq!(
            notif,
            serde_json::json!({
                "type": "file:change",
                "projectId": "p1",
                "fileType": "prd",
                "path": ".loop/prd.json",
                "event": "change",
            })
        );

        // `a` gets the pong next, not the change.
        let resp = send_json(&mut a, serde_json::json!({"type": "ping"})).await;
        assert_eq!(resp["type"], "pong");
    }

    #[tokio::test]
    async fn closing_client_removes_registry_entry() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect().await;
        send_json(&mut ws, serde_json::json!({"type": "subscribe", "projectIds": ["p1"]})).await;
        assert_eq!(server.registry.len(), 1);

        ws.close(None).await.unwrap();
        drop(ws);
        server.wait_for_connections(0).await;
        assert_eq!(server.registry.broadcast(&change("p1")).delivered, 0);
    }

    #[tokio::test]
    async fn unresponsive_client_is_terminated_by_heartbeat() {
        let server = start_test_server(None, Some(Duration::from_millis(100))).await;
        let mut silent = server.connect().await;
        send_json(&mut silent, serde_json::json!({"type": "subscribe", "projectIds": ["p1"]})).await;
        server.wait_for_connections(1).await;

        // Never read again, so pings go unanswered.
        server.wait_for_connections(0).await;
        assert_eq!(server.registry.broadcast(&change("p1")).delivered, 0);
    }

    #[tokio::test]
    async fn stalled_reader_releases_its_slot_after_termination() {
        let server = start_test_server(Some(1), Some(Duration::from_millis(100))).await;
        let mut stalled = server.connect().await;
        send_json(&mut stalled, serde_json::json!({"type": "subscribe", "projectIds": ["p1"]})).await;

        // Far more than the socket buffers hold, so the server's write blocks.
        let big = ChangeEvent {
            path: "x".repeat(1 << 20),
            ..change("p1")
        };
        for _ in 0..40 {
            server.registry.broadcast(&big);
        }
        server.wait_for_connections(0).await;

        let reconnected = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok((mut ws, _)) = tokio_tungstenite::connect_async(&server.ws_url()).await {
                    if ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.is_ok() {
                        if let Ok(Some(Ok(Message::Text(text)))) =
                            tokio::time::timeout(Duration::from_millis(500), ws.next()).await
                        {
                            return text;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("slot should be released once the stalled client is terminated");
        assert_eq!(reconnected, r#"{"type":"pong"}"#);
        drop(stalled);
    }

    #[tokio::test]
    async fn client_ping_frame_gets_pong() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect().await;
        ws.send(Message::Ping(b"hi".to_vec())).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Pong(b"hi".to_vec()));
    }

    #[tokio::test]
    async fn binary_frame_gets_error() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect().await;
        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        let resp = recv_json(&mut ws).await;
        assert_eq!(resp["type"], "error");
    }

    #[tokio::test]
    async fn origin_localhost_accepted() {
        let server = start_test_server(None, None).await;
        let mut ws = server.connect_with_origin("http://localhost:3000").await.unwrap();
        let resp = send_json(&mut ws, serde_json::json!({"type": "ping"})).await;
        assert_eq!(resp["type"], "pong");
    }

    #[tokio::test]
    async fn origin_remote_rejected() {
        let server = start_test_server(None, None).await;
        let result = server.connect_with_origin("https://evil.example.com").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connection_limit_enforced() {
        let server = start_test_server(Some(2), None).await;

        let _ws1 = server.connect().await;
        let _ws2 = server.connect().await;

        // The server drops the third TCP stream, so the handshake fails.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            tokio_tungstenite::connect_async(&server.ws_url()).await
        })
        .await;

        match result {
            Ok(Ok((mut ws, _))) => {
                let send_result = ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await;
                let next = ws.next().await;
                assert!(
                    send_result.is_err() || next.is_none() || next.unwrap().is_err(),
                    "third connection should not be fully functional"
                );
            }
            Ok(Err(_)) => {}
            Err(_) => {}
        }
    }
}
