use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bililive_sdk::config::LiveConfig;
use bililive_sdk::live::{LiveClient, LiveError};
use bililive_sdk::open_api::{OpenApiClient, OpenApiError};
use bililive_sdk::session::SessionError;
use bililive_sdk::signing::SignatureContext;
use bililive_sdk::stream::client::{StreamClientError, StreamStatus};
use bililive_sdk::stream::events::ChatMessage;
use bililive_sdk::stream::proto::{Frame, Operation};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const KEY_ID: &str = "harness-key-id";
const SECRET: &str = "harness-secret";
const ID_CODE: &str = "ID-CODE";
const APP_ID: i64 = 1234;
const GAME_ID: &str = "abc123";
const AUTH_BODY: &str = r#"{"roomid":42,"key":"harness-token"}"#;

#[derive(Clone, Copy, Debug, Default)]
enum StartMode {
    #[default]
    SingleEndpoint,
    DeadEndpointFirst,
    NoEndpoint,
    Refused,
}

#[derive(Clone, Default)]
struct Platform {
    mode: StartMode,
    auth_code: i64,
    close_after_chat: bool,
    failing_heartbeats: Arc<AtomicUsize>,
    heartbeats: Arc<AtomicUsize>,
    ended: Arc<Mutex<Vec<Value>>>,
    signature_failures: Arc<Mutex<Vec<String>>>,
}

impl Platform {
    fn with_mode(mode: StartMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_authenticate_and_dispatch_chat_then_close() {
    let platform = Platform::default();
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<ChatMessage>();
    client.on_chat(move |chat| {
        let _ = chat_tx.send(chat.clone());
    });

    let session = client.start().await.expect("start live client");
    assert_eq!(session.game_id, GAME_ID);
    assert_eq!(session.endpoints().len(), 1);
    assert_eq!(session.anchor.room_id, 42);

    timeout(Duration::from_secs(2), client.wait_authenticated())
        .await
        .expect("timed out waiting for auth reply")
        .expect("auth accepted");
    assert_eq!(
        client.stream_status().await,
        Some(StreamStatus::Authenticated)
    );

    let chat = timeout(Duration::from_secs(2), chat_rx.recv())
        .await
        .expect("timed out waiting for chat callback")
        .expect("chat channel open");
    assert_eq!(chat.uname, "viewer");
    assert_eq!(chat.msg, "hello from the harness");
    assert_eq!(chat.room_id, 42);
    assert_eq!(chat.fans_medal_level, 5);

    client.close().await.expect("close live client");
    assert!(client.session().await.is_none());
    assert!(client.stream_status().await.is_none());

    let ended = platform.ended.lock().await.clone();
    assert_eq!(ended, vec![json!({"game_id": GAME_ID, "app_id": APP_ID})]);
    assert!(platform.signature_failures.lock().await.is_empty());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_heartbeats_run_until_close() {
    let platform = Platform::default();
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    client.start().await.expect("start live client");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(platform.heartbeats.load(Ordering::SeqCst) >= 2);

    client.close().await.expect("close live client");
    let after_close = platform.heartbeats.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(platform.heartbeats.load(Ordering::SeqCst) <= after_close + 1);
    assert!(platform.signature_failures.lock().await.is_empty());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_session_heartbeats_do_not_stop_the_loop() {
    let platform = Platform {
        failing_heartbeats: Arc::new(AtomicUsize::new(3)),
        ..Platform::default()
    };
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    client.start().await.expect("start live client");

    timeout(Duration::from_secs(3), async {
        while platform.heartbeats.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("heartbeats should resume after failures");
    assert_eq!(platform.failing_heartbeats.load(Ordering::SeqCst), 0);
    assert!(client.session().await.is_some());

    client.close().await.expect("close live client");
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_after_auth_is_observable_and_ends_the_session() {
    let platform = Platform {
        close_after_chat: true,
        ..Platform::default()
    };
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<ChatMessage>();
    client.on_chat(move |chat| {
        let _ = chat_tx.send(chat.clone());
    });
    client.start().await.expect("start live client");
    let mut status = client.subscribe_status().await.expect("stream status");

    timeout(Duration::from_secs(2), chat_rx.recv())
        .await
        .expect("timed out waiting for chat callback")
        .expect("chat channel open");
    let last = timeout(
        Duration::from_secs(2),
        status.wait_for(|status| *status == StreamStatus::Closed),
    )
    .await
    .expect("timed out waiting for stream close")
    .map(|status| *status)
    .expect("status sender alive");
    assert_eq!(last, StreamStatus::Closed);

    timeout(Duration::from_secs(2), async {
        while client.session().await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should end once the stream is gone");
    assert_eq!(
        platform.ended.lock().await.clone(),
        vec![json!({"game_id": GAME_ID, "app_id": APP_ID})]
    );

    let after_loss = platform.heartbeats.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(platform.heartbeats.load(Ordering::SeqCst) <= after_loss + 1);

    client.close().await.expect("close after loss");
    assert_eq!(platform.ended.lock().await.len(), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_falls_back_to_the_next_endpoint() {
    let platform = Platform::with_mode(StartMode::DeadEndpointFirst);
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    let session = client.start().await.expect("start live client");
    assert_eq!(session.endpoints().len(), 2);
    timeout(Duration::from_secs(2), client.wait_authenticated())
        .await
        .expect("timed out waiting for auth reply")
        .expect("auth accepted");

    client.close().await.expect("close live client");
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_without_endpoints_ends_the_session() {
    let platform = Platform::with_mode(StartMode::NoEndpoint);
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    let result = client.start().await;
    assert!(matches!(result, Err(LiveError::NoEndpoint)), "{result:?}");
    assert!(client.session().await.is_none());
    assert_eq!(platform.ended.lock().await.len(), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_start_surfaces_the_platform_code() {
    let platform = Platform::with_mode(StartMode::Refused);
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    match client.start().await {
        Err(LiveError::Session(SessionError::Api(OpenApiError::Api {
            code, request_id, ..
        }))) => {
            assert_eq!(code, 7002);
            assert_eq!(request_id, "req-refused");
        }
        other => panic!("unexpected start result: {other:?}"),
    }
    assert!(client.session().await.is_none());
    assert!(platform.ended.lock().await.is_empty());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_auth_is_reported_and_close_still_ends_the_session() {
    let platform = Platform {
        auth_code: -101,
        ..Platform::default()
    };
    let (addr, shutdown_tx, server_task) = spawn_server(router(platform.clone())).await;

    let client = LiveClient::new(config(addr)).expect("build live client");
    client.start().await.expect("start live client");

    let verdict = timeout(Duration::from_secs(2), client.wait_authenticated())
        .await
        .expect("timed out waiting for auth reply");
    assert!(matches!(
        verdict,
        Err(LiveError::Stream(StreamClientError::AuthRejected { code: -101 }))
    ));
    assert_eq!(
        client.stream_status().await,
        Some(StreamStatus::AuthRejected(-101))
    );

    client.close().await.expect("close live client");
    assert_eq!(platform.ended.lock().await.len(), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_failure_keeps_the_body_verbatim() {
    let app = Router::new().route(
        "/v2/app/start",
        post(|| async { (StatusCode::BAD_GATEWAY, "upstream exploded") }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let api = OpenApiClient::new(&config(addr)).expect("build api client");
    match api.send(r#"{"code":"x","app_id":1}"#, "/v2/app/start").await {
        Err(OpenApiError::HttpStatus { status, body }) => {
            assert_eq!(status, StatusCode::BAD_GATEWAY);
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("unexpected send result: {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

fn config(addr: SocketAddr) -> LiveConfig {
    LiveConfig::new(KEY_ID, SecretString::new(SECRET.to_string()), ID_CODE, APP_ID)
        .with_api_host(format!("http://{addr}"))
        .with_session_heartbeat_interval(Duration::from_millis(50))
}

fn router(platform: Platform) -> Router {
    Router::new()
        .route("/v2/app/start", post(start_handler))
        .route("/v2/app/heartbeat", post(heartbeat_handler))
        .route("/v2/app/end", post(end_handler))
        .route("/sub", get(socket_handler))
        .with_state(platform)
}

async fn start_handler(
    State(platform): State<Platform>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(reason) = check_signature(&platform, &headers, &body).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": reason})));
    }
    let request: Value = serde_json::from_str(&body).unwrap_or_default();
    if request != json!({"code": ID_CODE, "app_id": APP_ID}) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "unexpected start body"})),
        );
    }

    let host = headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("127.0.0.1");
    let live = format!("ws://{host}/sub");
    let links = match platform.mode {
        StartMode::SingleEndpoint => vec![live],
        StartMode::DeadEndpointFirst => vec!["ws://127.0.0.1:1/sub".to_string(), live],
        StartMode::NoEndpoint => Vec::new(),
        StartMode::Refused => {
            return (
                StatusCode::OK,
                Json(json!({
                    "code": 7002,
                    "message": "game already started",
                    "request_id": "req-refused",
                    "data": {}
                })),
            );
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "code": 0,
            "message": "0",
            "request_id": "req-start",
            "data": {
                "game_info": {"game_id": GAME_ID},
                "websocket_info": {"auth_body": AUTH_BODY, "wss_link": links},
                "anchor_info": {
                    "room_id": 42,
                    "uname": "anchor",
                    "uface": "https://example.com/anchor.jpg",
                    "uid": 7,
                    "open_id": "anchor-open-id"
                }
            }
        })),
    )
}

async fn heartbeat_handler(
    State(platform): State<Platform>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(reason) = check_signature(&platform, &headers, &body).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": reason})));
    }
    let failing = platform
        .failing_heartbeats
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if failing {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "heartbeat store unavailable"})),
        );
    }
    let request: Value = serde_json::from_str(&body).unwrap_or_default();
    if request.get("game_id").and_then(Value::as_str) == Some(GAME_ID) {
        platform.heartbeats.fetch_add(1, Ordering::SeqCst);
    }
    (StatusCode::OK, Json(json!({"code": 0, "message": "0", "data": {}})))
}

async fn end_handler(
    State(platform): State<Platform>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(reason) = check_signature(&platform, &headers, &body).await {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": reason})));
    }
    let request: Value = serde_json::from_str(&body).unwrap_or_default();
    platform.ended.lock().await.push(request);
    (StatusCode::OK, Json(json!({"code": 0, "message": "0", "data": {}})))
}

async fn check_signature(
    platform: &Platform,
    headers: &HeaderMap,
    body: &str,
) -> Result<(), String> {
    let result = verify_signature(headers, body);
    if let Err(reason) = &result {
        platform.signature_failures.lock().await.push(reason.clone());
    }
    result
}

fn verify_signature(headers: &HeaderMap, body: &str) -> Result<(), String> {
    let timestamp = header(headers, "x-bili-timestamp")?
        .parse::<u64>()
        .map_err(|err| format!("bad timestamp: {err}"))?;
    let context = SignatureContext::with_values(
        header(headers, "x-bili-accesskeyid")?,
        body,
        timestamp,
        header(headers, "x-bili-signature-nonce")?.to_string(),
    );
    if context.access_key_id != KEY_ID {
        return Err("unexpected access key id".to_string());
    }
    if header(headers, "x-bili-content-md5")? != context.content_md5 {
        return Err("content md5 mismatch".to_string());
    }
    if header(headers, "x-bili-signature-method")? != "HMAC-SHA256" {
        return Err("unexpected signature method".to_string());
    }
    if header(headers, "x-bili-signature-version")? != "1.0" {
        return Err("unexpected signature version".to_string());
    }
    let expected = context.signature(&SecretString::new(SECRET.to_string()));
    if header(headers, "authorization")? != expected {
        return Err("signature mismatch".to_string());
    }
    Ok(())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| format!("missing header {name}"))
}

async fn socket_handler(
    State(platform): State<Platform>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth_code = platform.auth_code;
    let close_after_chat = platform.close_after_chat;
    ws.on_upgrade(move |socket| run_socket(socket, auth_code, close_after_chat))
}

async fn run_socket(mut socket: WebSocket, auth_code: i64, close_after_chat: bool) {
    let auth = match socket.recv().await {
        Some(Ok(Message::Binary(bytes))) => Frame::decode(&bytes).ok(),
        _ => None,
    };
    let authorized = auth
        .as_ref()
        .is_some_and(|frame| frame.operation == Operation::Auth && frame.payload == AUTH_BODY.as_bytes());
    if !authorized {
        let _ = socket.close().await;
        return;
    }

    let reply = json!({"code": auth_code}).to_string();
    if send_frame(&mut socket, Frame::new(Operation::AuthReply, 0, reply.into_bytes()))
        .await
        .is_err()
    {
        return;
    }

    if auth_code == 0 {
        let chat = json!({
            "cmd": "LIVE_OPEN_PLATFORM_DM",
            "data": {
                "room_id": 42,
                "uid": 0,
                "open_id": "viewer-open-id",
                "uname": "viewer",
                "uface": "https://example.com/viewer.jpg",
                "timestamp": 1_700_000_000,
                "msg": "hello from the harness",
                "msg_id": "msg-1",
                "guard_level": 0,
                "fans_medal_wearing_status": true,
                "fans_medal_name": "medal",
                "fans_medal_level": 5,
                "dm_type": 0
            }
        });
        let message = Frame::new(Operation::Message, 0, chat.to_string().into_bytes());
        if send_frame(&mut socket, message).await.is_err() {
            return;
        }
        if close_after_chat {
            let _ = socket.close().await;
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Close(_) = message {
            break;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> Result<(), axum::Error> {
    socket.send(Message::Binary(frame.encode())).await
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
