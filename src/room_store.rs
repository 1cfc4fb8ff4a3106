use crate::{
    error::{ChatError, Result},
    room::{ChatRoom, Eligibility, Member},
    store::{from_micros, to_micros},
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Durable room records with per-member read state.
///
/// Unread counters are only ever changed through single-row or single-statement
/// updates, never by writing a whole member list back.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Entry point for the upstream room-creation feed.
    async fn insert_room(&self, room: &ChatRoom) -> Result<()>;

    async fn find_room(&self, room_id: &str) -> Result<ChatRoom>;

    /// Like [`RoomStore::find_room`], but also requires `member_id` to have a
    /// member record in the room.
    async fn find_room_for_member(&self, room_id: &str, member_id: &str) -> Result<ChatRoom> {
        let room = self.find_room(room_id).await?;
        if room.member(member_id).is_none() {
            return Err(ChatError::membership(room_id, member_id));
        }
        Ok(room)
    }

    /// Atomically add one unread message for every member admitted by
    /// `eligibility`. Returns the ids that were incremented.
    async fn increment_unread(&self, room_id: &str, eligibility: &Eligibility) -> Result<Vec<String>>;

    /// Undo an [`RoomStore::increment_unread`] for exactly `member_ids`.
    async fn rollback_unread(&self, room_id: &str, member_ids: &[String]) -> Result<()>;

    async fn unread_count(&self, room_id: &str, member_id: &str) -> Result<u32>;

    async fn mark_read(&self, room_id: &str, member_id: &str) -> Result<()>;

    fn resolve_entry_time(&self, room: &ChatRoom, member_id: &str) -> Result<DateTime<Utc>> {
        room.entry_time_of(member_id)
    }
}

#[derive(Clone, Debug)]
pub struct SqliteRoomStore {
    pool: SqlitePool,
}

impl SqliteRoomStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomStore for SqliteRoomStore {
    async fn insert_room(&self, room: &ChatRoom) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("INSERT INTO chat_rooms (id, request_id, created_at) VALUES (?, ?, ?)")
            .bind(&room.id)
            .bind(&room.request_id)
            .bind(to_micros(room.created_at))
            .execute(&mut *tx)
            .await
            .context("Failed to insert chat room")?;

        for (position, member) in room.members.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO room_members (room_id, member_id, position, entry_time, exit_time, unread_count)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&room.id)
            .bind(&member.member_id)
            .bind(position as i64)
            .bind(to_micros(member.entry_time))
            .bind(member.exit_time.map(to_micros))
            .bind(i64::from(member.unread_count))
            .execute(&mut *tx)
            .await
            .context("Failed to insert room member")?;
        }

        tx.commit().await.context("Failed to commit chat room")?;

        debug!(room_id = %room.id, members = room.members.len(), "Chat room stored");
        Ok(())
    }

    async fn find_room(&self, room_id: &str) -> Result<ChatRoom> {
        // Room and members are read from one snapshot.
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let row = sqlx::query("SELECT id, request_id, created_at FROM chat_rooms WHERE id = ?")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to fetch chat room")?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;

        let member_rows = sqlx::query(
            r#"
            SELECT member_id, entry_time, exit_time, unread_count
            FROM room_members
            WHERE room_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(room_id)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fetch room members")?;

        tx.commit().await.context("Failed to finish room read")?;

        let mut members = Vec::with_capacity(member_rows.len());
        for row in member_rows {
            let exit_time: Option<i64> = row.try_get("exit_time").map_err(ChatError::from)?;
            let unread: i64 = row.try_get("unread_count").map_err(ChatError::from)?;
            members.push(Member {
                member_id: row.try_get("member_id").map_err(ChatError::from)?,
                entry_time: from_micros(row.try_get("entry_time").map_err(ChatError::from)?)?,
                exit_time: exit_time.map(from_micros).transpose()?,
                unread_count: u32::try_from(unread).context("Unread count out of range")?,
            });
        }

        Ok(ChatRoom {
            id: row.try_get("id").map_err(ChatError::from)?,
            request_id: row.try_get("request_id").map_err(ChatError::from)?,
            created_at: from_micros(row.try_get("created_at").map_err(ChatError::from)?)?,
            members,
        })
    }

    async fn increment_unread(&self, room_id: &str, eligibility: &Eligibility) -> Result<Vec<String>> {
        let at = to_micros(eligibility.at);

        // Same rule as `Eligibility::admits`, applied in one statement.
        let incremented: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE room_members
            SET unread_count = unread_count + 1
            WHERE room_id = ?
              AND member_id <> ?
              AND entry_time <= ?
              AND (exit_time IS NULL OR ? < exit_time)
            RETURNING member_id
            "#,
        )
        .bind(room_id)
        .bind(&eligibility.exclude_member_id)
        .bind(at)
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .context("Failed to increment unread counts")?;

        debug!(room_id, count = incremented.len(), "Unread counts incremented");
        Ok(incremented)
    }

    async fn rollback_unread(&self, room_id: &str, member_ids: &[String]) -> Result<()> {
        if member_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for member_id in member_ids {
            sqlx::query(
                r#"
                UPDATE room_members
                SET unread_count = MAX(unread_count - 1, 0)
                WHERE room_id = ? AND member_id = ?
                "#,
            )
            .bind(room_id)
            .bind(member_id)
            .execute(&mut *tx)
            .await
            .context("Failed to roll back unread count")?;
        }
        tx.commit().await.context("Failed to commit unread rollback")?;

        debug!(room_id, count = member_ids.len(), "Unread counts rolled back");
        Ok(())
    }

    async fn unread_count(&self, room_id: &str, member_id: &str) -> Result<u32> {
        let unread: Option<i64> = sqlx::query_scalar(
            "SELECT unread_count FROM room_members WHERE room_id = ? AND member_id = ?",
        )
        .bind(room_id)
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch unread count")?;

        let unread = unread.ok_or_else(|| ChatError::membership(room_id, member_id))?;
        Ok(u32::try_from(unread).context("Unread count out of range")?)
    }

    async fn mark_read(&self, room_id: &str, member_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE room_members SET unread_count = 0 WHERE room_id = ? AND member_id = ?",
        )
        .bind(room_id)
        .bind(member_id)
        .execute(&self.pool)
        .await
        .context("Failed to reset unread count")?;

        if result.rows_affected() == 0 {
            return Err(ChatError::membership(room_id, member_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::Duration;

    async fn rooms() -> SqliteRoomStore {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store.rooms()
    }

    fn mixed_room(now: DateTime<Utc>) -> ChatRoom {
        let t0 = now - Duration::hours(1);
        ChatRoom::new("r1", "req-1")
            .with_member(Member::new("sender", t0))
            .with_member(Member::new("present", t0))
            .with_member(Member::new("leaving-later", t0).exited_at(now + Duration::hours(1)))
            .with_member(Member::new("left", t0).exited_at(now - Duration::minutes(1)))
            .with_member(Member::new("invited-later", now + Duration::minutes(5)))
    }

    #[tokio::test]
    async fn find_room_keeps_join_order() {
        let rooms = rooms().await;
        let room = mixed_room(Utc::now());
        rooms.insert_room(&room).await.unwrap();

        let found = rooms.find_room("r1").await.unwrap();
        let ids: Vec<_> = found.members.iter().map(|m| m.member_id.as_str()).collect();
        assert_eq!(ids, vec!["sender", "present", "leaving-later", "left", "invited-later"]);
        assert_eq!(found.request_id, "req-1");
    }

    #[tokio::test]
    async fn lookups_distinguish_room_and_membership() {
        let rooms = rooms().await;
        rooms.insert_room(&mixed_room(Utc::now())).await.unwrap();

        assert!(matches!(rooms.find_room("nope").await, Err(ChatError::RoomNotFound(_))));
        assert!(matches!(
            rooms.find_room_for_member("nope", "present").await,
            Err(ChatError::RoomNotFound(_))
        ));
        assert!(matches!(
            rooms.find_room_for_member("r1", "stranger").await,
            Err(ChatError::MembershipNotFound { .. })
        ));
        assert!(rooms.find_room_for_member("r1", "left").await.is_ok());
    }

    #[tokio::test]
    async fn increment_matches_eligibility_rule() {
        let rooms = rooms().await;
        let now = Utc::now();
        let room = mixed_room(now);
        rooms.insert_room(&room).await.unwrap();

        let rule = Eligibility::for_sender("sender", now);
        let mut incremented = rooms.increment_unread("r1", &rule).await.unwrap();
        incremented.sort();

        let mut expected: Vec<_> = room
            .members
            .iter()
            .filter(|m| rule.admits(m))
            .map(|m| m.member_id.clone())
            .collect();
        expected.sort();
        assert_eq!(incremented, expected);
        assert_eq!(incremented, vec!["leaving-later", "present"]);

        let found = rooms.find_room("r1").await.unwrap();
        for member in &found.members {
            let want = u32::from(expected.contains(&member.member_id));
            assert_eq!(member.unread_count, want, "{}", member.member_id);
        }
    }

    #[tokio::test]
    async fn rollback_undoes_exactly_the_listed_members() {
        let rooms = rooms().await;
        let now = Utc::now();
        rooms.insert_room(&mixed_room(now)).await.unwrap();

        let rule = Eligibility::for_sender("sender", now);
        rooms.increment_unread("r1", &rule).await.unwrap();
        let second = rooms.increment_unread("r1", &rule).await.unwrap();
        rooms.rollback_unread("r1", &second).await.unwrap();

        assert_eq!(rooms.unread_count("r1", "present").await.unwrap(), 1);
        assert_eq!(rooms.unread_count("r1", "leaving-later").await.unwrap(), 1);
        assert_eq!(rooms.unread_count("r1", "sender").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rollback_never_goes_negative() {
        let rooms = rooms().await;
        rooms.insert_room(&mixed_room(Utc::now())).await.unwrap();

        rooms.rollback_unread("r1", &["present".to_string()]).await.unwrap();
        assert_eq!(rooms.unread_count("r1", "present").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn absent_member_keeps_historical_unread() {
        let rooms = rooms().await;
        let now = Utc::now();
        let mut room = mixed_room(now);
        room.members[3].unread_count = 7;
        rooms.insert_room(&room).await.unwrap();

        rooms
            .increment_unread("r1", &Eligibility::for_sender("sender", now))
            .await
            .unwrap();
        assert_eq!(rooms.unread_count("r1", "left").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let rooms = rooms().await;
        let now = Utc::now();
        rooms.insert_room(&mixed_room(now)).await.unwrap();

        let handles: Vec<_> = (0..25)
            .map(|i| {
                let rooms = rooms.clone();
                tokio::spawn(async move {
                    let rule = Eligibility::for_sender(format!("ghost-{}", i), now);
                    rooms.increment_unread("r1", &rule).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(rooms.unread_count("r1", "present").await.unwrap(), 25);
        assert_eq!(rooms.unread_count("r1", "sender").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn out_of_range_counter_is_a_store_error() {
        let rooms = rooms().await;
        rooms.insert_room(&mixed_room(Utc::now())).await.unwrap();
        sqlx::query("UPDATE room_members SET unread_count = ? WHERE room_id = 'r1' AND member_id = 'present'")
            .bind(i64::from(u32::MAX) + 1)
            .execute(&rooms.pool)
            .await
            .unwrap();

        assert!(matches!(
            rooms.unread_count("r1", "present").await,
            Err(ChatError::StoreUnavailable(_))
        ));
        assert!(matches!(rooms.find_room("r1").await, Err(ChatError::StoreUnavailable(_))));
        assert_eq!(rooms.unread_count("r1", "sender").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_room_never_sees_a_half_inserted_room() {
        let rooms = rooms().await;
        let now = Utc::now();

        let writer = {
            let rooms = rooms.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let mut room = mixed_room(now);
                    room.id = format!("r{}", i);
                    rooms.insert_room(&room).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        while !writer.is_finished() {
            for i in 0..20 {
                match rooms.find_room(&format!("r{}", i)).await {
                    Ok(room) => assert_eq!(room.members.len(), 5, "{}", room.id),
                    Err(ChatError::RoomNotFound(_)) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(rooms.find_room("r19").await.unwrap().members.len(), 5);
    }

    #[tokio::test]
    async fn mark_read_resets_counter() {
        let rooms = rooms().await;
        let now = Utc::now();
        rooms.insert_room(&mixed_room(now)).await.unwrap();
        rooms
            .increment_unread("r1", &Eligibility::for_sender("sender", now))
            .await
            .unwrap();

        rooms.mark_read("r1", "present").await.unwrap();
        assert_eq!(rooms.unread_count("r1", "present").await.unwrap(), 0);
        assert!(matches!(
            rooms.mark_read("r1", "stranger").await,
            Err(ChatError::MembershipNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn entry_time_resolves_from_the_room() {
        let rooms = rooms().await;
        let now = Utc::now();
        rooms.insert_room(&mixed_room(now)).await.unwrap();

        let room = rooms.find_room("r1").await.unwrap();
        let entry = rooms.resolve_entry_time(&room, "invited-later").unwrap();
        assert_eq!(entry, crate::store::truncate_micros(now + Duration::minutes(5)));
        assert!(rooms.resolve_entry_time(&room, "stranger").is_err());
    }
}
