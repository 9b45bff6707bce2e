//! Chat message model.
//!
//! A message carries either text or a sticker, never both. Delivery status
//! is monotonic: `sent -> delivered -> read`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MessageId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// Attempted to move a message status backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("status cannot move from {from:?} back to {to:?}")]
pub struct StatusRegression {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

impl MessageStatus {
    /// Move forward to `to`. Re-applying the current status is a no-op.
    pub fn advance(&mut self, to: MessageStatus) -> Result<bool, StatusRegression> {
        if to < *self {
            return Err(StatusRegression { from: *self, to });
        }
        let changed = to != *self;
        *self = to;
        Ok(changed)
    }
}

/// Payload of a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageBody {
    #[serde(rename = "content")]
    Text(String),
    #[serde(rename = "sticker")]
    Sticker(String),
}

impl MessageBody {
    pub fn is_blank(&self) -> bool {
        match self {
            MessageBody::Text(text) => text.trim().is_empty(),
            MessageBody::Sticker(id) => id.is_empty(),
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Sticker(_) => None,
        }
    }

    pub fn sticker(&self) -> Option<&str> {
        match self {
            MessageBody::Sticker(id) => Some(id),
            MessageBody::Text(_) => None,
        }
    }
}

/// A chat message as held by a conversation.
///
/// `id` is `None` only for optimistic entries that the server has not
/// echoed back yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawChatMessage", into = "RawChatMessage")]
pub struct ChatMessage {
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Build a local, not yet acknowledged message.
    pub fn optimistic(sender_id: UserId, receiver_id: UserId, body: MessageBody) -> Self {
        Self {
            id: None,
            sender_id,
            receiver_id,
            body,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            delivered_at: None,
            read_at: None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_none()
    }

    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (&self.sender_id == a && &self.receiver_id == b)
            || (&self.sender_id == b && &self.receiver_id == a)
    }

    /// Forward-only status change, stamping the matching timestamp.
    pub fn advance_status(&mut self, to: MessageStatus) -> Result<bool, StatusRegression> {
        let changed = self.status.advance(to)?;
        if changed {
            let now = Utc::now();
            if to >= MessageStatus::Delivered && self.delivered_at.is_none() {
                self.delivered_at = Some(now);
            }
            if to == MessageStatus::Read && self.read_at.is_none() {
                self.read_at = Some(now);
            }
        }
        Ok(changed)
    }
}

/// Wire shape: `content` and `sticker` are separate optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<MessageId>,
    sender_id: UserId,
    receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sticker: Option<String>,
    #[serde(default = "default_status")]
    status: MessageStatus,
    #[serde(alias = "created_at")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

fn default_status() -> MessageStatus {
    MessageStatus::Sent
}

impl TryFrom<RawChatMessage> for ChatMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawChatMessage) -> Result<Self, Self::Error> {
        let content = raw.content.filter(|c| !c.is_empty());
        let sticker = raw.sticker.filter(|s| !s.is_empty());
        let body = match (content, sticker) {
            (Some(text), None) => MessageBody::Text(text),
            (None, Some(id)) => MessageBody::Sticker(id),
            (Some(_), Some(_)) => {
                return Err(ProtocolError::InvalidFields {
                    kind: "message".into(),
                    reason: "both content and sticker present".into(),
                })
            }
            (None, None) => {
                return Err(ProtocolError::InvalidFields {
                    kind: "message".into(),
                    reason: "neither content nor sticker present".into(),
                })
            }
        };

        Ok(Self {
            id: raw.id,
            sender_id: raw.sender_id,
            receiver_id: raw.receiver_id,
            body,
            status: raw.status,
            timestamp: raw.timestamp,
            delivered_at: raw.delivered_at,
            read_at: raw.read_at,
        })
    }
}

impl From<ChatMessage> for RawChatMessage {
    fn from(msg: ChatMessage) -> Self {
        let (content, sticker) = match msg.body {
            MessageBody::Text(text) => (Some(text), None),
            MessageBody::Sticker(id) => (None, Some(id)),
        };
        Self {
            id: msg.id,
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content,
            sticker,
            status: msg.status,
            timestamp: msg.timestamp,
            delivered_at: msg.delivered_at,
            read_at: msg.read_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward() {
        let mut status = MessageStatus::Sent;
        assert_eq!(status.advance(MessageStatus::Delivered), Ok(true));
        assert_eq!(status.advance(MessageStatus::Read), Ok(true));
        assert_eq!(status.advance(MessageStatus::Read), Ok(false));
        assert_eq!(status, MessageStatus::Read);
    }

    #[test]
    fn test_status_regression_rejected() {
        let mut status = MessageStatus::Read;
        let err = status.advance(MessageStatus::Sent).unwrap_err();
        assert_eq!(err.from, MessageStatus::Read);
        assert_eq!(err.to, MessageStatus::Sent);
        assert_eq!(status, MessageStatus::Read);

        let mut delivered = MessageStatus::Delivered;
        assert!(delivered.advance(MessageStatus::Sent).is_err());
    }

    #[test]
    fn test_advance_status_stamps_read_time() {
        let mut msg = ChatMessage::optimistic(
            "a".into(),
            "b".into(),
            MessageBody::Text("hi".into()),
        );
        msg.advance_status(MessageStatus::Read).unwrap();
        assert!(msg.delivered_at.is_some());
        assert!(msg.read_at.is_some());
    }

    #[test]
    fn test_parse_sticker_message_with_null_content() {
        let json = r#"{
            "id": 12,
            "sender_id": "a",
            "receiver_id": "b",
            "content": null,
            "sticker": "cat-wave",
            "status": "delivered",
            "created_at": "2024-05-01T10:00:00Z"
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, Some(MessageId(12)));
        assert_eq!(msg.body, MessageBody::Sticker("cat-wave".into()));
        assert_eq!(msg.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_reject_message_with_both_bodies() {
        let json = r#"{
            "sender_id": "a",
            "receiver_id": "b",
            "content": "hi",
            "sticker": "cat",
            "timestamp": "2024-05-01T10:00:00Z"
        }"#;
        assert!(serde_json::from_str::<ChatMessage>(json).is_err());
    }

    #[test]
    fn test_blank_body() {
        assert!(MessageBody::Text("   \n".into()).is_blank());
        assert!(!MessageBody::Text(" x ".into()).is_blank());
        assert!(!MessageBody::Sticker("heart".into()).is_blank());
    }
}
