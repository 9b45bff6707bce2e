use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, MessageBody};
use crate::types::{Location, MessageId, UserId};

/// Frames a client sends on its channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Own position sample
    LocationUpdate {
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        username: String,
    },

    /// Chat message to a single receiver
    Message {
        receiver_id: UserId,
        #[serde(flatten)]
        body: MessageBody,
    },

    TypingStart {
        receiver_id: UserId,
    },

    TypingStop {
        receiver_id: UserId,
    },

    /// SDP offer addressed to one peer
    WebrtcOffer {
        target_id: UserId,
        offer: SessionDescription,
    },

    /// SDP answer addressed to one peer
    WebrtcAnswer {
        target_id: UserId,
        answer: SessionDescription,
    },

    /// Trickled ICE candidate addressed to one peer
    WebrtcIceCandidate {
        target_id: UserId,
        candidate: IceCandidate,
    },
}

/// Frames the relay delivers to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    LocationUpdate {
        user_id: UserId,
        location: Location,
    },

    /// Snapshot sent once right after connecting
    InitialLocations {
        locations: Vec<Location>,
    },

    /// Server-authoritative chat message (new or echoed)
    Message(ChatMessage),

    TypingStatus {
        sender_id: UserId,
        is_typing: bool,
    },

    /// The listed messages were read by their receiver
    MessagesRead {
        message_ids: Vec<MessageId>,
    },

    WebrtcOffer {
        sender_id: UserId,
        offer: SessionDescription,
    },

    WebrtcAnswer {
        sender_id: UserId,
        answer: SessionDescription,
    },

    WebrtcIceCandidate {
        sender_id: UserId,
        candidate: IceCandidate,
    },
}

impl InboundFrame {
    /// Every `type` discriminator the router recognizes.
    pub const KINDS: [&'static str; 8] = [
        "location_update",
        "initial_locations",
        "message",
        "typing_status",
        "messages_read",
        "webrtc_offer",
        "webrtc_answer",
        "webrtc_ice_candidate",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::LocationUpdate { .. } => "location_update",
            InboundFrame::InitialLocations { .. } => "initial_locations",
            InboundFrame::Message(_) => "message",
            InboundFrame::TypingStatus { .. } => "typing_status",
            InboundFrame::MessagesRead { .. } => "messages_read",
            InboundFrame::WebrtcOffer { .. } => "webrtc_offer",
            InboundFrame::WebrtcAnswer { .. } => "webrtc_answer",
            InboundFrame::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP blob together with its role, as exchanged during negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser-compatible JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_message_wire_shape() {
        let frame = OutboundFrame::Message {
            receiver_id: "bob".into(),
            body: MessageBody::Sticker("heart".into()),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "message", "receiver_id": "bob", "sticker": "heart"})
        );
    }

    #[test]
    fn test_outbound_location_omits_missing_accuracy() {
        let frame = OutboundFrame::LocationUpdate {
            lat: 10.5,
            lng: 106.6,
            accuracy: None,
            username: "mai".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "location_update");
        assert!(value.get("accuracy").is_none());
    }

    #[test]
    fn test_inbound_ice_candidate_browser_shape() {
        let value = json!({
            "type": "webrtc_ice_candidate",
            "sender_id": "alice",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        });
        let frame: InboundFrame = serde_json::from_value(value).unwrap();
        match frame {
            InboundFrame::WebrtcIceCandidate { sender_id, candidate } => {
                assert_eq!(sender_id, UserId::from("alice"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let frame = InboundFrame::MessagesRead {
            message_ids: vec![MessageId(5)],
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], frame.kind());
        assert!(InboundFrame::KINDS.contains(&frame.kind()));
    }
}
