use chatdrop_protocol::{AttachmentAvailable, UploadEvent};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Destination for events addressed to one uploader.
///
/// `emit` is called with the session lock held and must not block; a
/// slow or gone consumer loses events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: UploadEvent);
}

/// Sink that forwards into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: UploadEvent) {
        let _ = self.tx.send(event);
    }
}

/// Fan-out of [`AttachmentAvailable`] to the messaging subsystem.
///
/// Publishing never waits: subscribers that fall behind the channel
/// capacity see a `Lagged` error and miss events.
#[derive(Debug, Clone)]
pub struct AttachmentBus {
    tx: broadcast::Sender<AttachmentAvailable>,
}

impl AttachmentBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttachmentAvailable> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AttachmentAvailable) {
        let room = event.room_id.clone();
        match self.tx.send(event) {
            Ok(n) => debug!(room = %room, subscribers = n, "published attachment"),
            Err(_) => debug!(room = %room, "no attachment subscribers"),
        }
    }
}

impl Default for AttachmentBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(room: &str) -> AttachmentAvailable {
        AttachmentAvailable {
            room_id: room.into(),
            resource_id: "1".into(),
            uploader_id: "alice".into(),
            content_type: "image/png".into(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let bus = AttachmentBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(available("general"));
        assert_eq!(a.recv().await.unwrap().room_id, "general");
        assert_eq!(b.recv().await.unwrap().room_id, "general");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        AttachmentBus::default().publish(available("general"));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_events() {
        let bus = AttachmentBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(available(&format!("room-{i}")));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().room_id, "room-3");
    }
}
