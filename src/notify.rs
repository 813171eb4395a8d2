use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::TransitionNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for session transitions, one channel per booking.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<TransitionNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to transitions of a booking. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<TransitionNotice> {
        let sender = self
            .channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, booking_id: Ulid, notice: &TransitionNotice) {
        if let Some(sender) = self.channels.get(&booking_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop the booking's channel once its last subscriber is gone.
    pub fn release(&self, booking_id: &Ulid) {
        self.channels
            .remove_if(booking_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
