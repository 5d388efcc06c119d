//!
//! photowall notifier
//! ------------------
//! Fire-and-forget broadcast of newly discovered image URLs to all connected
//! viewers. Built on a tokio broadcast channel; the WebSocket layer in
//! `server` subscribes and forwards each batch as a `new_images` frame.
//! Delivery failure (no subscribers, lagged subscriber) never fails the
//! triggering request.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Event name carried on every frame, matching the client contract.
pub const NEW_IMAGES_EVENT: &str = "new_images";

const CHANNEL_CAPACITY: usize = 64;

/// JSON frame pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct NewImagesFrame<'a> {
    pub event: &'static str,
    pub urls: &'a [String],
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Vec<String>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Notifier { tx }
    }

    /// Broadcast one batch of new URLs. Empty batches are suppressed.
    pub fn broadcast(&self, urls: Vec<String>) {
        if urls.is_empty() {
            return;
        }
        // send() only errors when nobody is subscribed, which is fine.
        let delivered = self.tx.send(urls).unwrap_or(0);
        debug!(subscribers = delivered, "broadcast {NEW_IMAGES_EVENT}");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.tx.subscribe()
    }

    /// Serialize one batch as the wire frame sent over the WebSocket.
    pub fn frame(urls: &[String]) -> String {
        serde_json::to_string(&NewImagesFrame { event: NEW_IMAGES_EVENT, urls })
            .unwrap_or_else(|_| format!("{{\"event\":\"{NEW_IMAGES_EVENT}\",\"urls\":[]}}"))
    }
}
