//! Wake-ups for replay streams when new chat rows become visible.

use tokio::sync::broadcast;

/// Publishes the id of a VOD whose correlated chat just changed.
///
/// Subscribers that lag simply miss wake-ups and fall back to their poll
/// interval.
#[derive(Clone)]
pub struct ChatNotifier {
    sender: broadcast::Sender<i64>,
}

impl ChatNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn notify(&self, vod_id: i64) {
        let _ = self.sender.send(vod_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<i64> {
        self.sender.subscribe()
    }
}

impl Default for ChatNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}
