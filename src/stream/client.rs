//! Realtime event socket client.
//!
//! A connected [`StreamClient`] owns three background tasks that share one
//! cancellation token:
//!
//! - the reader decodes binary frames and pushes them into a bounded queue,
//! - the dispatcher routes queued frames by operation,
//! - the heartbeat writer owns the socket sink and, once authenticated,
//!   sends a HEARTBEAT frame every interval.
//!
//! The socket is closed exactly once, by the heartbeat writer, after the
//! token fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{LiveConfig, LiveDefaults};
use crate::stream::proto::{Frame, FrameError, Operation};

/// Callback receiving each MESSAGE body, in arrival order.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Connection lifecycle as observed by the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    /// AUTH sent, no reply yet.
    Connecting,
    Authenticated,
    /// The server refused the auth payload; the stream has been torn down.
    AuthRejected(i64),
    Closed,
}

/// Socket-level tuning for one stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamOptions {
    pub heartbeat_interval: Duration,
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: LiveDefaults::STREAM_HEARTBEAT_INTERVAL,
            read_timeout: None,
            connect_timeout: LiveDefaults::CONNECT_TIMEOUT,
            queue_capacity: LiveDefaults::FRAME_QUEUE_CAPACITY,
        }
    }
}

impl StreamOptions {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            heartbeat_interval: config.stream_heartbeat_interval,
            read_timeout: config.stream_read_timeout,
            connect_timeout: config.connect_timeout,
            ..Self::default()
        }
    }
}

/// Handle to a live event socket.
///
/// Dropping the handle does not stop the background tasks; call
/// [`StreamClient::close`].
pub struct StreamClient {
    cancel: CancellationToken,
    authenticated: Arc<AtomicBool>,
    status: watch::Receiver<StreamStatus>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl StreamClient {
    /// Opens `endpoint`, sends the AUTH frame, and starts the stream tasks.
    pub async fn connect(
        endpoint: &str,
        auth_body: &str,
        options: StreamOptions,
        handler: MessageHandler,
    ) -> Result<Self, StreamClientError> {
        let (socket, _) = tokio::time::timeout(options.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| StreamClientError::ConnectTimeout)??;
        debug!(event = "stream_socket_connected", endpoint);
        Self::from_socket(socket, auth_body, options, handler).await
    }

    /// Same as [`StreamClient::connect`] over an already-open websocket.
    pub async fn from_socket<S>(
        mut socket: WebSocketStream<S>,
        auth_body: &str,
        options: StreamOptions,
        handler: MessageHandler,
    ) -> Result<Self, StreamClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        socket
            .send(Message::Binary(Frame::auth(auth_body).encode()))
            .await?;

        let (sink, stream) = socket.split();
        let cancel = CancellationToken::new();
        let authenticated = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = watch::channel(StreamStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let (frame_tx, frame_rx) = mpsc::channel(options.queue_capacity.max(1));

        let reader = tokio::spawn(read_loop(
            stream,
            frame_tx,
            cancel.clone(),
            options.read_timeout,
        ));
        let dispatcher = tokio::spawn(dispatch_loop(
            frame_rx,
            handler,
            authenticated.clone(),
            status_tx.clone(),
            cancel.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            sink,
            options.heartbeat_interval,
            authenticated.clone(),
            status_tx,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            authenticated,
            status: status_rx,
            tasks: Mutex::new(Some(vec![reader, dispatcher, heartbeat])),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    /// Returns a receiver that observes every status transition.
    pub fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Waits for the server's verdict on the AUTH frame.
    pub async fn wait_authenticated(&self) -> Result<(), StreamClientError> {
        auth_verdict(self.status.clone()).await
    }

    /// Resolves once the stream has shut down, for whatever reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Cancels all tasks and waits for them to finish.
    ///
    /// Safe to call any number of times; only the first call waits.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(tasks) = tasks else {
            return;
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!(event = "stream_task_join_failed", error = %err);
            }
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Errors returned while opening a stream.
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("authentication rejected with code {code}")]
    AuthRejected { code: i64 },

    #[error("stream is closed")]
    Closed,
}

/// Resolves with the first status past `Connecting`.
pub async fn auth_verdict(
    mut status: watch::Receiver<StreamStatus>,
) -> Result<(), StreamClientError> {
    let verdict = *status
        .wait_for(|status| *status != StreamStatus::Connecting)
        .await
        .map_err(|_| StreamClientError::Closed)?;
    match verdict {
        StreamStatus::Authenticated => Ok(()),
        StreamStatus::AuthRejected(code) => Err(StreamClientError::AuthRejected { code }),
        StreamStatus::Connecting | StreamStatus::Closed => Err(StreamClientError::Closed),
    }
}

#[derive(Debug, Deserialize)]
struct AuthReply {
    #[serde(default)]
    code: i64,
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    read_timeout: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = read_next(&mut stream, read_timeout) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) if is_transient(&err) => {
                warn!(event = "stream_read_skipped", error = %err);
                continue;
            }
            Ok(Some(Err(err))) => {
                warn!(event = "stream_read_failed", error = %err);
                break;
            }
            Ok(None) => {
                debug!(event = "stream_read_eof");
                break;
            }
            Err(_) => {
                warn!(
                    event = "stream_read_timeout",
                    timeout_ms = read_timeout.map(|t| t.as_millis() as u64)
                );
                break;
            }
        };

        match message {
            Message::Binary(bytes) => match Frame::decode(&bytes) {
                Ok(frame) => {
                    // A full queue parks the reader here until the dispatcher drains it.
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = frames.send(frame) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(err) if is_keepalive_ack(&bytes, &err) => {
                    trace!(event = "stream_heartbeat_reply");
                }
                Err(err) => {
                    warn!(event = "stream_frame_dropped", reason = %err, len = bytes.len());
                }
            },
            Message::Close(frame) => {
                debug!(event = "stream_close_received", frame = ?frame);
                break;
            }
            other => {
                trace!(event = "stream_message_ignored", kind = message_kind(&other));
            }
        }
    }
    cancel.cancel();
}

async fn read_next<St>(
    stream: &mut St,
    read_timeout: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, Elapsed>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match read_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Header-only HEARTBEAT_REPLY frames fail decode as empty; they are routine.
fn is_keepalive_ack(bytes: &[u8], err: &FrameError) -> bool {
    matches!(err, FrameError::EmptyBody { .. })
        && Frame::peek_operation(bytes) == Some(Operation::HeartbeatReply)
}

/// An oversized message is refused on its own; every other error means the
/// connection is gone.
fn is_transient(err: &WsError) -> bool {
    matches!(err, WsError::Capacity(_))
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

async fn dispatch_loop(
    mut frames: mpsc::Receiver<Frame>,
    handler: MessageHandler,
    authenticated: Arc<AtomicBool>,
    status: Arc<watch::Sender<StreamStatus>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match frame.operation {
            Operation::AuthReply => {
                let reply: AuthReply = match serde_json::from_slice(&frame.payload) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(event = "stream_auth_reply_malformed", error = %err);
                        continue;
                    }
                };
                if reply.code == 0 {
                    authenticated.store(true, Ordering::Release);
                    status.send_replace(StreamStatus::Authenticated);
                    info!(event = "stream_authenticated");
                } else {
                    error!(event = "stream_auth_rejected", code = reply.code);
                    status.send_replace(StreamStatus::AuthRejected(reply.code));
                    cancel.cancel();
                    break;
                }
            }
            Operation::HeartbeatReply => {
                trace!(event = "stream_heartbeat_reply", sequence = frame.sequence);
            }
            Operation::Message => match frame.message_bodies() {
                Ok(bodies) => {
                    for body in &bodies {
                        handler(body);
                    }
                }
                Err(err) => {
                    warn!(
                        event = "stream_frame_dropped",
                        reason = %err,
                        version = frame.version
                    );
                }
            },
            other => {
                debug!(event = "stream_frame_ignored", operation = other.code());
            }
        }
    }
}

async fn heartbeat_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    period: Duration,
    authenticated: Arc<AtomicBool>,
    status: Arc<watch::Sender<StreamStatus>>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence: i32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !authenticated.load(Ordering::Acquire) {
                    trace!(event = "stream_heartbeat_skipped");
                    continue;
                }
                if let Err(err) = send_frame(&mut sink, &Frame::heartbeat(sequence)).await {
                    warn!(event = "stream_heartbeat_failed", sequence, error = %err);
                    cancel.cancel();
                    break;
                }
                trace!(event = "stream_heartbeat_sent", sequence);
                sequence = sequence.wrapping_add(1);
            }
        }
    }

    if let Err(err) = sink.close().await {
        debug!(event = "stream_close_failed", error = %err);
    }
    status.send_if_modified(|current| {
        if matches!(current, StreamStatus::AuthRejected(_) | StreamStatus::Closed) {
            return false;
        }
        *current = StreamStatus::Closed;
        true
    });
    info!(event = "stream_closed");
}

async fn send_frame<Si>(sink: &mut Si, frame: &Frame) -> Result<(), WsError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Binary(frame.encode())).await
}
