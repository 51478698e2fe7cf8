//! Realtime event socket modules.
//!
//! - `proto`: binary frame codec.
//! - `client`: websocket transport with reader, dispatcher, and heartbeat
//!   tasks.
//! - `events`: typed audience events decoded from MESSAGE bodies.

/// Websocket transport and stream lifecycle.
pub mod client;
/// Typed live events and their decoder.
pub mod events;
/// Binary frame encoding and decoding.
pub mod proto;
