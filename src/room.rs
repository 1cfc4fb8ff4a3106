use crate::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: String,
    /// Id of the request that caused the room to be created upstream.
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    /// Ordered by join.
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub member_id: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl ChatRoom {
    pub fn new(id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request_id: request_id.into(),
            created_at: Utc::now(),
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.member_id == member_id)
    }

    pub fn entry_time_of(&self, member_id: &str) -> Result<DateTime<Utc>> {
        self.member(member_id)
            .map(|m| m.entry_time)
            .ok_or_else(|| ChatError::membership(&self.id, member_id))
    }
}

impl Member {
    pub fn new(member_id: impl Into<String>, entry_time: DateTime<Utc>) -> Self {
        Self {
            member_id: member_id.into(),
            entry_time,
            exit_time: None,
            unread_count: 0,
        }
    }

    pub fn exited_at(mut self, exit_time: DateTime<Utc>) -> Self {
        self.exit_time = Some(exit_time);
        self
    }

    /// Whether the membership window includes `now`.
    pub fn is_present_at(&self, now: DateTime<Utc>) -> bool {
        self.entry_time <= now && self.exit_time.map_or(true, |exit| now < exit)
    }
}

/// Which members get an unread increment for a message: everyone present at
/// `at` except the sender.
#[derive(Debug, Clone)]
pub struct Eligibility {
    pub exclude_member_id: String,
    pub at: DateTime<Utc>,
}

impl Eligibility {
    pub fn for_sender(sender_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            exclude_member_id: sender_id.into(),
            at,
        }
    }

    pub fn admits(&self, member: &Member) -> bool {
        member.member_id != self.exclude_member_id && member.is_present_at(self.at)
    }
}
