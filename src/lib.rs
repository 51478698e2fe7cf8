//! Rust SDK for the Bilibili live open platform.
//!
//! The crate is organized by transport surface:
//! - `config`: explicit client configuration.
//! - `signing` and `open_api`: signed HTTP client for the session endpoints.
//! - `session`: session lifecycle and keep-alive.
//! - `stream`: realtime websocket client, frame codec, and event decoding.
//! - `live`: facade that wires sessions, the socket, and event callbacks.
//! - `collab`: model interfaces and the chat relay.

/// Model collaborator interfaces and chat relay.
pub mod collab;
/// Client configuration and defaults.
pub mod config;
/// High-level live room client.
pub mod live;
/// Open-platform HTTP client and request/response types.
pub mod open_api;
/// Session start, keep-alive, and end.
pub mod session;
/// Request signature construction.
pub mod signing;
/// Realtime stream client, frame codec, and event types.
pub mod stream;

pub use config::{ConfigError, LiveConfig, LiveDefaults};
pub use live::{LiveClient, LiveError};
pub use session::{Session, SessionError, SessionManager};
pub use stream::client::{StreamClient, StreamClientError, StreamStatus};
pub use stream::events::{EventKind, LiveEvent};
