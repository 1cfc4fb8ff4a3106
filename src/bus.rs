use crate::message::Message;
use futures::stream::Stream;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 100;

type Rooms = Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>;

/// In-memory fan-out of freshly persisted messages, one channel per room.
///
/// Nothing is stored or replayed: a subscriber only sees messages published
/// after it subscribed. Each subscriber has its own ring of `capacity`
/// messages; when it falls behind, the oldest unread messages are dropped for
/// that subscriber only and it carries on with the newest ones.
#[derive(Clone)]
pub struct BroadcastHub {
    rooms: Rooms,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, room_id: &str) -> Subscription {
        let rx = lock(&self.rooms)
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!(room_id, "Subscriber attached");
        Subscription {
            room_id: room_id.to_string(),
            rooms: self.rooms.clone(),
            rx: Some(rx),
        }
    }

    /// Fan `message` out to the current subscribers of its room. Never blocks;
    /// returns how many subscribers it reached.
    pub fn publish(&self, message: Message) -> usize {
        let rooms = lock(&self.rooms);
        match rooms.get(&message.room_id) {
            // No receivers is not an error: the message is already durable.
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        lock(&self.rooms)
            .get(room_id)
            .map_or(0, |tx| tx.receiver_count())
    }

    pub fn active_rooms(&self) -> usize {
        lock(&self.rooms).len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live feed of one room. Cancelled explicitly with [`Subscription::cancel`]
/// or implicitly on drop.
pub struct Subscription {
    room_id: String,
    rooms: Rooms,
    rx: Option<broadcast::Receiver<Message>>,
}

impl Subscription {
    pub fn is_cancelled(&self) -> bool {
        self.rx.is_none()
    }

    /// Next message for this subscriber, or `None` once cancelled.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(room_id = %self.room_id, skipped, "Subscriber lagged, dropping oldest messages");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.cancel();
                    return None;
                }
            }
        }
    }

    /// Release this subscriber's channel. Calling it again is a no-op.
    pub fn cancel(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        drop(rx);

        let mut rooms = lock(&self.rooms);
        if rooms
            .get(&self.room_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            rooms.remove(&self.room_id);
        }
        debug!(room_id = %self.room_id, "Subscriber detached");
    }

    /// The subscription as a stream; it ends on cancel and detaches on drop.
    pub fn into_stream(self) -> impl Stream<Item = Message> {
        let mut subscription = self;
        async_stream::stream! {
            while let Some(message) = subscription.recv().await {
                yield message;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(rooms: &Rooms) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Message>>> {
    rooms.lock().unwrap_or_else(PoisonError::into_inner)
}
