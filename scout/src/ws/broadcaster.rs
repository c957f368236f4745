//! Patch stream shared by every WebSocket session.
//!
//! Patches only apply to the state they were diffed against, so a session
//! that falls behind the channel is told how far it lagged and must be
//! re-synced with a full snapshot before it can continue.

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::ws::types::{BroadcastMessage, WsError};

/// Patches buffered per session before it counts as lagging.
const PATCH_BACKLOG: usize = 256;

#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PATCH_BACKLOG);
        Self { sender }
    }

    pub fn subscribe(&self) -> BroadcastReceiver {
        metrics::gauge!("scout_ws_clients").increment(1.0);
        debug!(clients = self.sender.receiver_count() + 1, "Session joined patch stream");
        BroadcastReceiver {
            inner: self.sender.subscribe(),
        }
    }

    /// Publishing between sessions, with nobody listening, is normal.
    pub fn broadcast(&self, message: BroadcastMessage) {
        metrics::counter!("scout_ws_messages_total", "kind" => message.kind()).increment(1);
        match self.sender.send(message) {
            Ok(sessions) => trace!(sessions, "Published to patch stream"),
            Err(_) => trace!("No sessions on patch stream"),
        }
    }

    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BroadcastReceiver {
    inner: broadcast::Receiver<BroadcastMessage>,
}

impl BroadcastReceiver {
    /// Next message in publication order. `Lagged` means patches were lost
    /// and the session's copy of the state is stale.
    pub async fn recv(&mut self) -> Result<BroadcastMessage, WsError> {
        self.inner.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => WsError::ChannelClosed,
            broadcast::error::RecvError::Lagged(skipped) => {
                warn!(skipped, "Session lagged behind patch stream");
                metrics::counter!("scout_ws_resyncs_total").increment(1);
                WsError::Lagged(skipped)
            }
        })
    }

    /// Drops everything still queued and continues from the next message
    /// published. The caller must hold off publication while doing this and
    /// pair it with the state as of that moment.
    pub(crate) fn skip_to_tail(&mut self) {
        self.inner = self.inner.resubscribe();
    }
}

impl Drop for BroadcastReceiver {
    fn drop(&mut self) {
        metrics::gauge!("scout_ws_clients").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::WsPatch;

    fn patch(cycle: u64) -> BroadcastMessage {
        BroadcastMessage::Patch(WsPatch {
            cycle,
            patch: json_patch::Patch(Vec::new()),
        })
    }

    #[tokio::test]
    async fn client_count_follows_live_sessions() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.client_count(), 0);

        let first = broadcaster.subscribe();
        let _second = broadcaster.subscribe();
        assert_eq!(broadcaster.client_count(), 2);

        drop(first);
        assert_eq!(broadcaster.client_count(), 1);
    }

    #[tokio::test]
    async fn patches_arrive_in_publication_order() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(patch(1));
        broadcaster.broadcast(patch(2));
        broadcaster.broadcast(BroadcastMessage::Shutdown);

        assert!(matches!(rx.recv().await, Ok(BroadcastMessage::Patch(WsPatch { cycle: 1, .. }))));
        assert!(matches!(rx.recv().await, Ok(BroadcastMessage::Patch(WsPatch { cycle: 2, .. }))));
        assert!(matches!(rx.recv().await, Ok(BroadcastMessage::Shutdown)));
    }

    #[tokio::test]
    async fn publishing_without_sessions_is_harmless() {
        let broadcaster = Broadcaster::new();
        broadcaster.broadcast(patch(1));
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[tokio::test]
    async fn lagging_session_learns_how_much_it_missed() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        for cycle in 0..(PATCH_BACKLOG as u64 + 10) {
            broadcaster.broadcast(patch(cycle));
        }
        assert!(matches!(rx.recv().await, Err(WsError::Lagged(10))));
        // The channel is still open after lag.
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn skip_to_tail_discards_the_backlog() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.broadcast(patch(1));
        broadcaster.broadcast(patch(2));

        rx.skip_to_tail();
        broadcaster.broadcast(patch(3));

        assert!(matches!(rx.recv().await, Ok(BroadcastMessage::Patch(WsPatch { cycle: 3, .. }))));
        assert_eq!(broadcaster.client_count(), 1);
    }
}
