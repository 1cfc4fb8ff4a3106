use thiserror::Error;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat room not found: {0}")]
    RoomNotFound(String),

    #[error("member {member_id} is not part of chat room {room_id}")]
    MembershipNotFound { room_id: String, member_id: String },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("invalid page request: {0}")]
    InvalidPageRequest(String),

    /// Persistence failure. Never retried here; callers decide.
    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
}

impl ChatError {
    pub fn membership(room_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self::MembershipNotFound {
            room_id: room_id.into(),
            member_id: member_id.into(),
        }
    }

    pub fn invalid_payload(kind: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            kind: kind.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        Self::StoreUnavailable(err)
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.into())
    }
}
