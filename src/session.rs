//! Open-platform session lifecycle.
//!
//! A [`SessionManager`] moves between two states, `Idle` and `Active`. While
//! active it keeps the session alive with a background heartbeat loop that
//! calls the heartbeat endpoint on a fixed interval. Heartbeat failures are
//! logged and never end the session.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LiveConfig;
use crate::open_api::{
    AnchorInfo, AppHeartbeatRequest, EndAppRequest, OpenApiClient, OpenApiError, StartAppData,
    StartAppRequest, WebsocketInfo, APP_END_PATH, APP_HEARTBEAT_PATH, APP_START_PATH,
};

/// One registered broadcast session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub game_id: String,
    pub anchor: AnchorInfo,
    pub websocket: WebsocketInfo,
}

impl Session {
    /// Payload for the socket AUTH frame.
    pub fn auth_body(&self) -> &str {
        &self.websocket.auth_body
    }

    /// Socket endpoints in the order the platform returned them.
    pub fn endpoints(&self) -> &[String] {
        &self.websocket.wss_link
    }
}

impl From<StartAppData> for Session {
    fn from(data: StartAppData) -> Self {
        Self {
            game_id: data.game_info.game_id,
            anchor: data.anchor_info,
            websocket: data.websocket_info,
        }
    }
}

enum SessionState {
    Idle,
    Active(ActiveSession),
}

struct ActiveSession {
    session: Session,
    heartbeat: CancellationToken,
}

/// Starts, keeps alive, and ends open-platform sessions.
pub struct SessionManager {
    api: OpenApiClient,
    id_code: String,
    app_id: i64,
    heartbeat_interval: Duration,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(config: &LiveConfig) -> Result<Self, OpenApiError> {
        Ok(Self::with_client(
            OpenApiClient::new(config)?,
            config.id_code.clone(),
            config.app_id,
            config.session_heartbeat_interval,
        ))
    }

    pub fn with_client(
        api: OpenApiClient,
        id_code: String,
        app_id: i64,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            api,
            id_code,
            app_id,
            heartbeat_interval,
            state: Mutex::new(SessionState::Idle),
        }
    }

    /// Registers a new session and starts its heartbeat loop.
    ///
    /// Fails with [`SessionError::AlreadyActive`] without touching the
    /// network when a session is already running.
    pub async fn start_session(&self) -> Result<Session, SessionError> {
        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::Active(_)) {
            return Err(SessionError::AlreadyActive);
        }

        let request = StartAppRequest {
            code: self.id_code.clone(),
            app_id: self.app_id,
        };
        let data: StartAppData = self.api.call(APP_START_PATH, &request).await?;
        let session = Session::from(data);

        let heartbeat = CancellationToken::new();
        tokio::spawn(heartbeat_loop(
            self.api.clone(),
            session.game_id.clone(),
            self.heartbeat_interval,
            heartbeat.clone(),
        ));

        info!(
            event = "session_started",
            game_id = %session.game_id,
            room_id = session.anchor.room_id,
            endpoints = session.endpoints().len()
        );
        *state = SessionState::Active(ActiveSession {
            session: session.clone(),
            heartbeat,
        });
        Ok(session)
    }

    /// Stops the heartbeat loop and ends the session.
    ///
    /// The manager is `Idle` afterwards even when the end call fails; that
    /// failure is still returned.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let active = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Idle => return Err(SessionError::NoActiveSession),
            SessionState::Active(active) => active,
        };
        active.heartbeat.cancel();

        let request = EndAppRequest {
            game_id: active.session.game_id.clone(),
            app_id: self.app_id,
        };
        let result: Result<Value, OpenApiError> = self.api.call(APP_END_PATH, &request).await;
        match result {
            Ok(_) => {
                info!(event = "session_ended", game_id = %request.game_id);
                Ok(())
            }
            Err(err) => {
                warn!(event = "session_end_failed", game_id = %request.game_id, error = %err);
                Err(err.into())
            }
        }
    }

    /// Stops the heartbeat loop but keeps the session registered.
    pub async fn stop_heartbeat(&self) {
        if let SessionState::Active(active) = &*self.state.lock().await {
            active.heartbeat.cancel();
        }
    }

    pub async fn is_active(&self) -> bool {
        matches!(*self.state.lock().await, SessionState::Active(_))
    }

    pub async fn current(&self) -> Option<Session> {
        match &*self.state.lock().await {
            SessionState::Active(active) => Some(active.session.clone()),
            SessionState::Idle => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("no active session")]
    NoActiveSession,

    #[error(transparent)]
    Api(#[from] OpenApiError),
}

async fn heartbeat_loop(
    api: OpenApiClient,
    game_id: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let request = AppHeartbeatRequest { game_id };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // In-flight calls run to completion; their result is ignored once stopped.
        let result: Result<Value, OpenApiError> = api.call(APP_HEARTBEAT_PATH, &request).await;
        if cancel.is_cancelled() {
            break;
        }
        match result {
            Ok(_) => debug!(event = "session_heartbeat_ok", game_id = %request.game_id),
            Err(err) => {
                warn!(event = "session_heartbeat_failed", game_id = %request.game_id, error = %err)
            }
        }
    }
    debug!(event = "session_heartbeat_stopped", game_id = %request.game_id);
}
