use crate::{
    bus::{BroadcastHub, Subscription},
    error::Result,
    message::{Message, MessageDraft, MessageKind, Page, PageRequest, Payload},
    message_store::MessageStore,
    room::Eligibility,
    room_store::RoomStore,
    store::truncate_micros,
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Coordinates the room store, the message log and the live hub.
///
/// A send bumps unread counters, appends the message and only then publishes
/// it, so live subscribers never see a message whose bookkeeping failed. The
/// stores share no transaction; a failed append is compensated by rolling the
/// unread increments back.
#[derive(Clone)]
pub struct ChatService {
    rooms: Arc<dyn RoomStore>,
    messages: Arc<dyn MessageStore>,
    hub: BroadcastHub,
    max_page_size: u32,
}

impl ChatService {
    pub fn new(rooms: Arc<dyn RoomStore>, messages: Arc<dyn MessageStore>, hub: BroadcastHub) -> Self {
        Self {
            rooms,
            messages,
            hub,
            max_page_size: 100,
        }
    }

    pub fn with_max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    #[instrument(skip(self, payload))]
    pub async fn send(
        &self,
        room_id: &str,
        sender_id: &str,
        kind: MessageKind,
        payload: Value,
    ) -> Result<Message> {
        // Only the room is checked here; reads go through the stricter member gate.
        self.rooms.find_room(room_id).await?;

        let payload = Payload::decode(kind, payload)?;

        // The unread rule and the stored creation time use the same instant.
        let now = truncate_micros(Utc::now());
        let draft = MessageDraft::new(room_id, sender_id, kind, payload).at(now);
        let eligibility = Eligibility::for_sender(sender_id, now);
        let incremented = self.rooms.increment_unread(room_id, &eligibility).await?;

        let message = match self.messages.append(draft).await {
            Ok(message) => message,
            Err(err) => {
                warn!(room_id, error = %err, "Append failed, rolling back unread counts");
                if let Err(rollback_err) = self.rooms.rollback_unread(room_id, &incremented).await {
                    error!(room_id, error = %rollback_err, "Failed to roll back unread counts");
                }
                return Err(err);
            }
        };

        let delivered = self.hub.publish(message.clone());
        info!(
            message_id = %message.id,
            unread_bumped = incremented.len(),
            delivered,
            "Message sent"
        );

        Ok(message)
    }

    /// History visible to `requester_id`: only messages created before they
    /// entered the room.
    #[instrument(skip(self))]
    pub async fn get_page(
        &self,
        room_id: &str,
        requester_id: &str,
        request: PageRequest,
    ) -> Result<Page> {
        request.validate(self.max_page_size)?;

        let room = self.rooms.find_room_for_member(room_id, requester_id).await?;
        let cutoff = self.rooms.resolve_entry_time(&room, requester_id)?;

        let page = self.messages.page_before(room_id, cutoff, request).await?;
        debug!(returned = page.messages.len(), last = page.last, "Page served");
        Ok(page)
    }

    /// Live feed of messages published from now on. No history is replayed.
    #[instrument(skip(self))]
    pub async fn get_stream(&self, room_id: &str, requester_id: &str) -> Result<Subscription> {
        self.rooms.find_room_for_member(room_id, requester_id).await?;
        Ok(self.hub.subscribe(room_id))
    }

    pub async fn unread_count(&self, room_id: &str, member_id: &str) -> Result<u32> {
        self.rooms.find_room_for_member(room_id, member_id).await?;
        self.rooms.unread_count(room_id, member_id).await
    }

    #[instrument(skip(self))]
    pub async fn mark_read(&self, room_id: &str, member_id: &str) -> Result<()> {
        self.rooms.find_room_for_member(room_id, member_id).await?;
        self.rooms.mark_read(room_id, member_id).await
    }

    /// Parse the transport's type tag before calling [`ChatService::send`].
    pub async fn send_tagged(
        &self,
        room_id: &str,
        sender_id: &str,
        type_tag: &str,
        payload: Value,
    ) -> Result<Message> {
        let kind: MessageKind = type_tag.parse()?;
        self.send(room_id, sender_id, kind, payload).await
    }
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("max_page_size", &self.max_page_size)
            .finish_non_exhaustive()
    }
}
