use chrono::{DateTime, Utc};

use crate::errors::SessionError;
use crate::session::Session;
use crate::signal::{self, SignalRequest};
use crate::state::RoomStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender_id: String, text: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            text,
            timestamp,
        }
    }
}

/// Send a chat message to the room. The server echoes it back as a
/// `chat_message` event, which is what lands in the session's chat log.
pub(crate) fn send_message(session: &Session, text: &str) -> Result<(), SessionError> {
    if text.trim().is_empty() {
        return Err(SessionError::Room("empty chat message".into()));
    }
    if session.snapshot().room.status != RoomStatus::Connected {
        return Err(SessionError::NotConnected);
    }
    signal::send(
        session,
        SignalRequest::ChatMessage {
            text: text.to_string(),
        },
    )
}
