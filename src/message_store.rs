use crate::{
    error::{ChatError, Result},
    message::{Direction, Message, MessageDraft, MessageKind, Page, PageRequest, Payload},
    store::{from_micros, to_micros, truncate_micros},
};
use anyhow::Context;
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use sqlx::{error::DatabaseError, sqlite::SqliteRow, Row, SqlitePool};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_BATCH: i64 = 100;

/// Durable, time-ordered message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id and creation time if missing.
    /// Creation times are unique within a room: a time already taken is moved
    /// forward one microsecond at a time until it is free.
    async fn append(&self, draft: MessageDraft) -> Result<Message>;

    /// Messages of `room_id` created strictly before `cutoff`.
    async fn page_before(
        &self,
        room_id: &str,
        cutoff: DateTime<Utc>,
        request: PageRequest,
    ) -> Result<Page>;

    /// Unbounded tail of messages created at or after `since`. Dropping the
    /// stream stops it; a store failure ends it with an error item.
    fn stream_from(&self, room_id: &str, since: DateTime<Utc>) -> BoxStream<'static, Result<Message>>;
}

#[derive(Clone, Debug)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message> {
        let mut message = Message {
            id: draft.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            room_id: draft.room_id,
            sender_id: draft.sender_id,
            kind: draft.kind,
            payload: draft.payload,
            created_at: truncate_micros(draft.created_at.unwrap_or_else(Utc::now)),
        };

        let payload = serde_json::to_string(&message.payload)
            .context("Failed to encode message payload")?;

        loop {
            let inserted = sqlx::query(
                r#"
                INSERT INTO messages (id, room_id, sender_id, kind, payload, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(&message.room_id)
            .bind(&message.sender_id)
            .bind(message.kind.as_str())
            .bind(&payload)
            .bind(to_micros(message.created_at))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => break,
                Err(sqlx::Error::Database(ref e)) if is_time_collision(&**e) => {
                    debug!(room_id = %message.room_id, created_at = %message.created_at, "Creation time taken, moving forward");
                    message.created_at += ChronoDuration::microseconds(1);
                }
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to save message").into()),
            }
        }

        debug!(message_id = %message.id, room_id = %message.room_id, "Message appended");
        Ok(message)
    }

    async fn page_before(
        &self,
        room_id: &str,
        cutoff: DateTime<Utc>,
        request: PageRequest,
    ) -> Result<Page> {
        let order = match request.direction {
            Direction::Descending => "created_at DESC",
            Direction::Ascending => "created_at ASC",
        };

        // One extra row tells us whether anything remains past this page. Times
        // are unique per room, so that row is also strictly older than the page.
        let sql = format!(
            r#"
            SELECT id, room_id, sender_id, kind, payload, created_at
            FROM messages
            WHERE room_id = ? AND created_at < ?
            ORDER BY {order}
            LIMIT ? OFFSET ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(room_id)
            .bind(to_micros(cutoff))
            .bind(i64::from(request.size) + 1)
            .bind(request.offset())
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch chat page")?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let size = request.size as usize;
        let last = messages.len() <= size;
        messages.truncate(size);

        Ok(Page { messages, last })
    }

    fn stream_from(&self, room_id: &str, since: DateTime<Utc>) -> BoxStream<'static, Result<Message>> {
        tail(self.pool.clone(), room_id.to_string(), since, self.poll_interval).boxed()
    }
}

fn tail(
    pool: SqlitePool,
    room_id: String,
    since: DateTime<Utc>,
    poll_interval: Duration,
) -> impl Stream<Item = Result<Message>> {
    try_stream! {
        let mut last_seq: i64 = 0;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let rows = sqlx::query(
                r#"
                SELECT seq, id, room_id, sender_id, kind, payload, created_at
                FROM messages
                WHERE room_id = ? AND created_at >= ? AND seq > ?
                ORDER BY seq ASC
                LIMIT ?
                "#,
            )
            .bind(&room_id)
            .bind(to_micros(since))
            .bind(last_seq)
            .bind(POLL_BATCH)
            .fetch_all(&pool)
            .await
            .context("Failed to poll messages")
            .map_err(ChatError::from)?;

            for row in rows {
                last_seq = row.try_get("seq").map_err(ChatError::from)?;
                let message = message_from_row(&row).map_err(ChatError::from)?;
                yield message;
            }
        }
    }
}

fn is_time_collision(e: &dyn DatabaseError) -> bool {
    e.is_unique_violation() && e.message().contains("messages.created_at")
}

fn message_from_row(row: &SqliteRow) -> anyhow::Result<Message> {
    let kind: String = row.try_get("kind")?;
    let kind: MessageKind = kind.parse()?;
    let payload: String = row.try_get("payload")?;
    let payload: Value = serde_json::from_str(&payload).context("Corrupt message payload")?;

    Ok(Message {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        sender_id: row.try_get("sender_id")?,
        kind,
        payload: Payload::decode(kind, payload)?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn store() -> SqliteMessageStore {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store.messages().with_poll_interval(Duration::from_millis(10))
    }

    fn texts(page: &Page) -> Vec<&str> {
        page.messages
            .iter()
            .filter_map(|m| m.payload.as_text())
            .collect()
    }

    #[tokio::test]
    async fn append_assigns_id_and_timestamp() {
        let messages = store().await;
        let before = Utc::now() - ChronoDuration::seconds(1);

        let stored = messages.append(MessageDraft::text("r1", "a", "hi")).await.unwrap();

        assert!(!stored.id.is_empty());
        assert!(stored.created_at >= before);
        assert_eq!(stored.sender_id, "a");

        let page = messages
            .page_before("r1", Utc::now() + ChronoDuration::seconds(1), PageRequest::new(10))
            .await
            .unwrap();
        assert_eq!(page.messages, vec![stored]);
    }

    #[tokio::test]
    async fn append_keeps_caller_supplied_identity() {
        let messages = store().await;
        let at = Utc::now() - ChronoDuration::hours(2);
        let mut draft = MessageDraft::text("r1", "a", "hi").at(at);
        draft.id = Some("fixed-id".into());

        let stored = messages.append(draft).await.unwrap();
        assert_eq!(stored.id, "fixed-id");
        assert_eq!(stored.created_at, truncate_micros(at));
    }

    #[tokio::test]
    async fn pages_newest_first_strictly_before_cutoff() {
        let messages = store().await;
        let t0 = Utc::now() - ChronoDuration::hours(1);

        for (i, text) in ["one", "two", "three", "four"].iter().enumerate() {
            messages
                .append(MessageDraft::text("r1", "a", text).at(t0 + ChronoDuration::minutes(i as i64)))
                .await
                .unwrap();
        }
        messages
            .append(MessageDraft::text("other", "a", "elsewhere").at(t0))
            .await
            .unwrap();

        let cutoff = t0 + ChronoDuration::minutes(3);
        let first = messages.page_before("r1", cutoff, PageRequest::new(2)).await.unwrap();
        assert_eq!(texts(&first), vec!["three", "two"]);
        assert!(!first.last);
        assert!(first.messages.iter().all(|m| m.created_at < cutoff));

        let second = messages
            .page_before("r1", cutoff, PageRequest::new(2).page(1))
            .await
            .unwrap();
        assert_eq!(texts(&second), vec!["one"]);
        assert!(second.last);
    }

    #[tokio::test]
    async fn ascending_pages_oldest_first() {
        let messages = store().await;
        let t0 = Utc::now() - ChronoDuration::hours(1);
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            messages
                .append(MessageDraft::text("r1", "a", text).at(t0 + ChronoDuration::minutes(i as i64)))
                .await
                .unwrap();
        }

        let page = messages
            .page_before("r1", Utc::now(), PageRequest::new(3).direction(Direction::Ascending))
            .await
            .unwrap();
        assert_eq!(texts(&page), vec!["one", "two", "three"]);
        assert!(page.last);
    }

    #[tokio::test]
    async fn colliding_times_move_forward_in_insertion_order() {
        let messages = store().await;
        let t0 = truncate_micros(Utc::now() - ChronoDuration::hours(1));
        let first = messages.append(MessageDraft::text("r1", "a", "first").at(t0)).await.unwrap();
        let second = messages.append(MessageDraft::text("r1", "b", "second").at(t0)).await.unwrap();
        let third = messages.append(MessageDraft::text("r1", "c", "third").at(t0)).await.unwrap();
        let elsewhere = messages.append(MessageDraft::text("r2", "a", "other room").at(t0)).await.unwrap();

        assert_eq!(first.created_at, t0);
        assert_eq!(second.created_at, t0 + ChronoDuration::microseconds(1));
        assert_eq!(third.created_at, t0 + ChronoDuration::microseconds(2));
        assert_eq!(elsewhere.created_at, t0);

        let page = messages.page_before("r1", Utc::now(), PageRequest::new(10)).await.unwrap();
        assert_eq!(texts(&page), vec!["third", "second", "first"]);
        assert_eq!(page.messages[1], second);
    }

    #[tokio::test]
    async fn last_flag_holds_for_messages_sent_at_the_same_instant() {
        let messages = store().await;
        let t0 = Utc::now() - ChronoDuration::hours(1);
        messages.append(MessageDraft::text("r1", "a", "first").at(t0)).await.unwrap();
        messages.append(MessageDraft::text("r1", "b", "second").at(t0)).await.unwrap();

        let page = messages.page_before("r1", Utc::now(), PageRequest::new(1)).await.unwrap();
        assert_eq!(texts(&page), vec!["second"]);

        let next = messages
            .page_before("r1", page.messages[0].created_at, PageRequest::new(1))
            .await
            .unwrap();
        assert_eq!(texts(&next), vec!["first"]);
        assert_eq!(page.last, next.messages.is_empty());
        assert!(next.last);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_store_error() {
        let messages = store().await;
        let mut draft = MessageDraft::text("r1", "a", "hi");
        draft.id = Some("same".into());
        messages.append(draft.clone()).await.unwrap();

        let err = messages.append(draft).await.unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn empty_room_is_an_empty_last_page() {
        let messages = store().await;
        let page = messages.page_before("nobody", Utc::now(), PageRequest::new(5)).await.unwrap();
        assert_eq!(page, Page::empty());
    }

    #[tokio::test]
    async fn exact_fit_page_is_last() {
        let messages = store().await;
        let t0 = Utc::now() - ChronoDuration::hours(1);
        messages.append(MessageDraft::text("r1", "a", "one").at(t0)).await.unwrap();
        messages
            .append(MessageDraft::text("r1", "a", "two").at(t0 + ChronoDuration::minutes(1)))
            .await
            .unwrap();

        let page = messages.page_before("r1", Utc::now(), PageRequest::new(2)).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page.last);
    }

    #[tokio::test]
    async fn card_payload_survives_storage() {
        let messages = store().await;
        let payload = Payload::decode(
            MessageKind::Card,
            serde_json::json!({ "title": "Lesson", "fields": { "seats": 4 } }),
        )
        .unwrap();
        let stored = messages
            .append(MessageDraft::new("r1", "a", MessageKind::Card, payload))
            .await
            .unwrap();

        let page = messages.page_before("r1", Utc::now() + ChronoDuration::seconds(1), PageRequest::new(1)).await.unwrap();
        assert_eq!(page.messages[0], stored);
    }

    #[tokio::test]
    async fn stream_from_tails_new_appends() {
        let messages = store().await;
        let since = Utc::now() - ChronoDuration::seconds(1);
        messages
            .append(MessageDraft::text("r1", "a", "too old").at(since - ChronoDuration::minutes(5)))
            .await
            .unwrap();

        let mut tail = messages.stream_from("r1", since);
        messages.append(MessageDraft::text("r1", "a", "one")).await.unwrap();
        messages.append(MessageDraft::text("r2", "a", "other room")).await.unwrap();
        messages.append(MessageDraft::text("r1", "b", "two")).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), tail.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), tail.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.payload.as_text(), Some("one"));
        assert_eq!(second.payload.as_text(), Some("two"));

        messages.append(MessageDraft::text("r1", "a", "three")).await.unwrap();
        let third = tokio::time::timeout(Duration::from_secs(2), tail.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third.payload.as_text(), Some("three"));
    }
}
