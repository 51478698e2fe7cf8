//! High-level live room client.
//!
//! [`LiveClient`] ties the session manager, the event socket, and the event
//! decoder together: `start` registers a session and connects its socket,
//! decoded events fan out to per-kind callbacks, and `close` tears it all
//! down again. A stream that shuts down on its own ends its session.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::ChatRelay;
use crate::config::{ConfigError, LiveConfig};
use crate::open_api::OpenApiError;
use crate::session::{Session, SessionError, SessionManager};
use crate::stream::client::{
    auth_verdict, MessageHandler, StreamClient, StreamClientError, StreamOptions, StreamStatus,
};
use crate::stream::events::{
    decode_event, ChatMessage, EventKind, GiftMessage, GuardMessage, LiveEvent, SuperChatMessage,
};

/// Callback invoked for every event of one kind.
pub type EventHandler = Arc<dyn Fn(&LiveEvent) + Send + Sync>;

/// One handler per [`EventKind`]; registering again replaces it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
}

impl HandlerRegistry {
    pub fn set(&self, kind: EventKind, handler: EventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn remove(&self, kind: EventKind) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Calls the handler for `event`'s kind. Returns `false` if none is set.
    pub fn dispatch(&self, event: &LiveEvent) -> bool {
        let kind = event.kind();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                debug!(event = "live_event_unhandled", kind = kind.as_str());
                false
            }
        }
    }

    /// Decodes one MESSAGE body and dispatches it; undecodable bodies are skipped.
    pub fn dispatch_body(&self, body: &[u8]) {
        match decode_event(body) {
            Ok(event) => {
                self.dispatch(&event);
            }
            Err(err) => warn!(event = "live_event_skipped", error = %err),
        }
    }
}

/// Live room client for one broadcaster.
pub struct LiveClient {
    options: StreamOptions,
    sessions: Arc<SessionManager>,
    handlers: Arc<HandlerRegistry>,
    stream: Mutex<Option<ActiveStream>>,
}

struct ActiveStream {
    client: StreamClient,
    // Detaches the loss watcher so `close` ends the session itself.
    watcher: CancellationToken,
}

impl ActiveStream {
    async fn shutdown(self) {
        self.watcher.cancel();
        self.client.close().await;
    }
}

impl LiveClient {
    /// Validates `config` and builds the client. No network activity happens
    /// until [`LiveClient::start`].
    pub fn new(config: LiveConfig) -> Result<Self, LiveError> {
        config.validate()?;
        Ok(Self {
            options: StreamOptions::from_config(&config),
            sessions: Arc::new(SessionManager::new(&config)?),
            handlers: Arc::new(HandlerRegistry::default()),
            stream: Mutex::new(None),
        })
    }

    /// Registers the handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&LiveEvent) + Send + Sync + 'static,
    {
        self.handlers.set(kind, Arc::new(handler));
    }

    /// Registers a handler by its kind string, e.g. `"danmu"`.
    pub fn on_kind<F>(&self, kind: &str, handler: F) -> Result<(), LiveError>
    where
        F: Fn(&LiveEvent) + Send + Sync + 'static,
    {
        let kind =
            EventKind::from_str(kind).map_err(|_| LiveError::UnknownEventKind(kind.to_string()))?;
        self.on(kind, handler);
        Ok(())
    }

    pub fn on_chat<F>(&self, handler: F)
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.on(EventKind::Chat, move |event| {
            if let LiveEvent::Chat(chat) = event {
                handler(chat);
            }
        });
    }

    pub fn on_gift<F>(&self, handler: F)
    where
        F: Fn(&GiftMessage) + Send + Sync + 'static,
    {
        self.on(EventKind::Gift, move |event| {
            if let LiveEvent::Gift(gift) = event {
                handler(gift);
            }
        });
    }

    pub fn on_super_chat<F>(&self, handler: F)
    where
        F: Fn(&SuperChatMessage) + Send + Sync + 'static,
    {
        self.on(EventKind::SuperChat, move |event| {
            if let LiveEvent::SuperChat(super_chat) = event {
                handler(super_chat);
            }
        });
    }

    pub fn on_guard<F>(&self, handler: F)
    where
        F: Fn(&GuardMessage) + Send + Sync + 'static,
    {
        self.on(EventKind::Guard, move |event| {
            if let LiveEvent::Guard(guard) = event {
                handler(guard);
            }
        });
    }

    /// Routes chat events through `relay`. Replaces any chat handler.
    pub fn attach_relay(&self, relay: Arc<ChatRelay>) {
        self.on_chat(move |chat| {
            relay.handle(chat);
        });
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Starts a session and connects its event socket.
    ///
    /// Endpoints are tried in the order returned. If none connects, the new
    /// session is ended again before the error is returned.
    pub async fn start(&self) -> Result<Session, LiveError> {
        let mut stream = self.stream.lock().await;
        let session = self.sessions.start_session().await?;

        if let Some(stale) = stream.take() {
            stale.shutdown().await;
        }

        match self.connect_stream(&session).await {
            Ok(client) => {
                let watcher = watch_for_loss(&client, self.sessions.clone());
                *stream = Some(ActiveStream { client, watcher });
                info!(event = "live_started", game_id = %session.game_id);
                Ok(session)
            }
            Err(err) => {
                if let Err(end_err) = self.sessions.end_session().await {
                    warn!(event = "live_start_cleanup_failed", error = %end_err);
                }
                Err(err)
            }
        }
    }

    async fn connect_stream(&self, session: &Session) -> Result<StreamClient, LiveError> {
        let mut last_error = None;
        for endpoint in session.endpoints() {
            let handlers = self.handlers.clone();
            let on_message: MessageHandler =
                Arc::new(move |body: &[u8]| handlers.dispatch_body(body));
            match StreamClient::connect(endpoint, session.auth_body(), self.options, on_message)
                .await
            {
                Ok(client) => {
                    info!(event = "live_stream_connected", endpoint = %endpoint);
                    return Ok(client);
                }
                Err(err) => {
                    warn!(event = "live_stream_connect_failed", endpoint = %endpoint, error = %err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.map_or(LiveError::NoEndpoint, LiveError::Stream))
    }

    /// Waits for the socket's auth verdict.
    pub async fn wait_authenticated(&self) -> Result<(), LiveError> {
        let Some(status) = self.subscribe_status().await else {
            return Err(LiveError::NotStarted);
        };
        auth_verdict(status).await?;
        Ok(())
    }

    pub async fn stream_status(&self) -> Option<StreamStatus> {
        self.stream
            .lock()
            .await
            .as_ref()
            .map(|active| active.client.status())
    }

    /// Observes every status change of the current stream, including a
    /// server-side close after authentication. `None` before `start`.
    pub async fn subscribe_status(&self) -> Option<watch::Receiver<StreamStatus>> {
        self.stream
            .lock()
            .await
            .as_ref()
            .map(|active| active.client.subscribe_status())
    }

    pub async fn session(&self) -> Option<Session> {
        self.sessions.current().await
    }

    /// Stops the heartbeat, closes the socket, and ends the session.
    ///
    /// Every step runs even if an earlier one failed. Closing a client that
    /// was never started is a no-op.
    pub async fn close(&self) -> Result<(), LiveError> {
        self.sessions.stop_heartbeat().await;

        if let Some(active) = self.stream.lock().await.take() {
            active.shutdown().await;
        }

        match self.sessions.end_session().await {
            Ok(()) | Err(SessionError::NoActiveSession) => Ok(()),
            Err(err) => {
                warn!(event = "live_close_failed", error = %err);
                Err(err.into())
            }
        }
    }
}

/// Ends the session once `client` stops without `close` being called.
fn watch_for_loss(client: &StreamClient, sessions: Arc<SessionManager>) -> CancellationToken {
    let detached = CancellationToken::new();
    let guard = detached.clone();
    let mut status = client.subscribe_status();
    tokio::spawn(async move {
        let lost = tokio::select! {
            _ = guard.cancelled() => return,
            lost = status.wait_for(|status| {
                matches!(status, StreamStatus::Closed | StreamStatus::AuthRejected(_))
            }) => lost.map(|status| *status),
        };
        // A dropped sender means the stream tasks are gone too.
        let status = lost.unwrap_or(StreamStatus::Closed);
        warn!(event = "live_stream_lost", status = ?status);
        match sessions.end_session().await {
            Ok(()) | Err(SessionError::NoActiveSession) => {}
            Err(err) => warn!(event = "live_stream_lost_cleanup_failed", error = %err),
        }
    });
    detached
}

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] OpenApiError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Stream(#[from] StreamClientError),

    #[error("session returned no socket endpoint")]
    NoEndpoint,

    #[error("client has not been started")]
    NotStarted,

    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),
}
