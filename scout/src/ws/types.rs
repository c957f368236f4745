use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RFC 6902 patch turning the previously published snapshot into the current one.
#[derive(Debug, Clone, Serialize)]
pub struct WsPatch {
    pub cycle: u64,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// Full state, sent to a client right after it connects.
    Snapshot { snapshot: Value },
    Patch(WsPatch),
    Shutdown,
}

impl BroadcastMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Patch(_) => "patch",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error)]
pub enum WsError {
    #[error("broadcast channel closed")]
    ChannelClosed,
    #[error("session lagged {0} messages behind the patch stream")]
    Lagged(u64),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
