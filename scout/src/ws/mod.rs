//! WebSocket fan-out of snapshot patches.

pub mod broadcaster;
pub mod handler;
pub mod types;

pub use broadcaster::{BroadcastReceiver, Broadcaster};
pub use types::{BroadcastMessage, ClientId, WsError, WsPatch};
