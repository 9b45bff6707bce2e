//! Inbound frame demultiplexing.
//!
//! [`route`] turns raw text into a typed [`InboundFrame`] or a
//! [`ProtocolError`]; [`dispatch`] fans a frame out to the matching
//! [`FrameHandler`] method. Components implement only the methods for the
//! traffic they care about; every other kind falls through to a no-op.

use async_trait::async_trait;
use serde_json::Value;

use huddle_shared::error::ProtocolError;
use huddle_shared::message::ChatMessage;
use huddle_shared::protocol::{IceCandidate, InboundFrame, SessionDescription};
use huddle_shared::types::{Location, MessageId, UserId};

/// Parse one raw frame.
pub fn route(raw: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Json(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    if !InboundFrame::KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
        kind,
        reason: e.to_string(),
    })
}

#[async_trait]
#[allow(unused_variables)]
pub trait FrameHandler: Send {
    async fn on_location_update(&mut self, user_id: UserId, location: Location) {}

    async fn on_initial_locations(&mut self, locations: Vec<Location>) {}

    async fn on_message(&mut self, message: ChatMessage) {}

    async fn on_typing_status(&mut self, sender_id: UserId, is_typing: bool) {}

    async fn on_messages_read(&mut self, message_ids: Vec<MessageId>) {}

    async fn on_offer(&mut self, sender_id: UserId, offer: SessionDescription) {}

    async fn on_answer(&mut self, sender_id: UserId, answer: SessionDescription) {}

    async fn on_ice_candidate(&mut self, sender_id: UserId, candidate: IceCandidate) {}
}

/// Hand `frame` to the handler method for its kind.
pub async fn dispatch<H>(frame: InboundFrame, handler: &mut H)
where
    H: FrameHandler + ?Sized,
{
    match frame {
        InboundFrame::LocationUpdate { user_id, location } => {
            handler.on_location_update(user_id, location).await
        }
        InboundFrame::InitialLocations { locations } => {
            handler.on_initial_locations(locations).await
        }
        InboundFrame::Message(message) => handler.on_message(message).await,
        InboundFrame::TypingStatus {
            sender_id,
            is_typing,
        } => handler.on_typing_status(sender_id, is_typing).await,
        InboundFrame::MessagesRead { message_ids } => {
            handler.on_messages_read(message_ids).await
        }
        InboundFrame::WebrtcOffer { sender_id, offer } => {
            handler.on_offer(sender_id, offer).await
        }
        InboundFrame::WebrtcAnswer { sender_id, answer } => {
            handler.on_answer(sender_id, answer).await
        }
        InboundFrame::WebrtcIceCandidate {
            sender_id,
            candidate,
        } => handler.on_ice_candidate(sender_id, candidate).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::message::MessageBody;

    #[test]
    fn test_route_rejects_invalid_json() {
        assert!(matches!(route("{not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_route_rejects_missing_type() {
        assert_eq!(route(r#"{"user_id": "a"}"#), Err(ProtocolError::MissingType));
        assert_eq!(route(r#"{"type": 7}"#), Err(ProtocolError::MissingType));
    }

    #[test]
    fn test_route_rejects_unknown_type() {
        assert_eq!(
            route(r#"{"type": "music_sync", "track": 3}"#),
            Err(ProtocolError::UnknownType("music_sync".into()))
        );
    }

    #[test]
    fn test_route_rejects_bad_fields() {
        let err = route(r#"{"type": "typing_status", "sender_id": "a"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFields { ref kind, .. } if kind == "typing_status"));
    }

    #[test]
    fn test_route_location_update() {
        let raw = r#"{
            "type": "location_update",
            "user_id": "mai",
            "location": {
                "user_id": "mai", "username": "Mai",
                "lat": 10.76, "lng": 106.66, "accuracy": 12.0,
                "timestamp": "2024-05-01T10:00:00Z"
            }
        }"#;
        match route(raw).unwrap() {
            InboundFrame::LocationUpdate { user_id, location } => {
                assert_eq!(user_id.as_str(), "mai");
                assert_eq!(location.accuracy, Some(12.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_route_message() {
        let raw = r#"{
            "type": "message", "id": 3, "sender_id": "a", "receiver_id": "b",
            "content": "hello", "status": "sent", "timestamp": "2024-05-01T10:00:00Z"
        }"#;
        match route(raw).unwrap() {
            InboundFrame::Message(msg) => {
                assert_eq!(msg.id, Some(MessageId(3)));
                assert_eq!(msg.body, MessageBody::Text("hello".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<&'static str>,
    }

    #[async_trait]
    impl FrameHandler for Recorder {
        async fn on_typing_status(&mut self, _sender_id: UserId, _is_typing: bool) {
            self.seen.push("typing");
        }

        async fn on_messages_read(&mut self, _message_ids: Vec<MessageId>) {
            self.seen.push("read");
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_matching_handler() {
        let mut recorder = Recorder::default();

        dispatch(
            InboundFrame::MessagesRead {
                message_ids: vec![MessageId(1)],
            },
            &mut recorder,
        )
        .await;
        dispatch(
            InboundFrame::InitialLocations { locations: vec![] },
            &mut recorder,
        )
        .await;
        dispatch(
            InboundFrame::TypingStatus {
                sender_id: "b".into(),
                is_typing: true,
            },
            &mut recorder,
        )
        .await;

        assert_eq!(recorder.seen, vec!["read", "typing"]);
    }
}
