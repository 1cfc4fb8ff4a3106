//! Message delivery and read-state core of a chat backend: message log,
//! room membership with unread counters, live per-room fan-out, and
//! membership-scoped history.

pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod message;
pub mod message_store;
pub mod room;
pub mod room_store;
pub mod service;
pub mod store;

pub use bus::{BroadcastHub, Subscription};
pub use error::{ChatError, Result};
pub use message::{Card, Direction, Message, MessageDraft, MessageKind, Page, PageRequest, Payload};
pub use message_store::{MessageStore, SqliteMessageStore};
pub use room::{ChatRoom, Eligibility, Member};
pub use room_store::{RoomStore, SqliteRoomStore};
pub use service::ChatService;
pub use store::Store;
