use serde::Serialize;
use tokio::sync::mpsc;

use huddle_media::{CallEvent, CallState, RejectReason};
use huddle_shared::message::ChatMessage;
use huddle_shared::types::UserId;

use crate::presence::VisibleLocation;

pub const EVENT_LOCATIONS_CHANGED: &str = "locations-changed";
pub const EVENT_CONVERSATION_CHANGED: &str = "conversation-changed";
pub const EVENT_PEER_TYPING: &str = "peer-typing";
pub const EVENT_INCOMING_CALL: &str = "incoming-call";
pub const EVENT_INCOMING_CALL_CLEARED: &str = "incoming-call-cleared";
pub const EVENT_CALL_REJECTED: &str = "call-rejected";
pub const EVENT_CALL_STATE_CHANGED: &str = "call-state-changed";
pub const EVENT_CALL_TRACK: &str = "call-track";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationPayload {
    pub peer: Option<UserId>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TypingPayload {
    pub peer: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IncomingCallPayload {
    pub caller: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallRejectedPayload {
    pub from: UserId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallStatePayload {
    pub state: String,
    pub peer: Option<UserId>,
    /// User-facing text for a failed call.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackPayload {
    pub kind: String,
    pub remote: bool,
    pub id: Option<String>,
    pub enabled: Option<bool>,
}

/// Everything the client surfaces to its front end.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    LocationsChanged(Vec<VisibleLocation>),
    ConversationChanged(ConversationPayload),
    PeerTyping(TypingPayload),
    IncomingCall(IncomingCallPayload),
    IncomingCallCleared { caller: UserId },
    CallRejected(CallRejectedPayload),
    CallStateChanged(CallStatePayload),
    CallTrack(TrackPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::LocationsChanged(_) => EVENT_LOCATIONS_CHANGED,
            ClientEvent::ConversationChanged(_) => EVENT_CONVERSATION_CHANGED,
            ClientEvent::PeerTyping(_) => EVENT_PEER_TYPING,
            ClientEvent::IncomingCall(_) => EVENT_INCOMING_CALL,
            ClientEvent::IncomingCallCleared { .. } => EVENT_INCOMING_CALL_CLEARED,
            ClientEvent::CallRejected(_) => EVENT_CALL_REJECTED,
            ClientEvent::CallStateChanged(_) => EVENT_CALL_STATE_CHANGED,
            ClientEvent::CallTrack(_) => EVENT_CALL_TRACK,
        }
    }

    pub(crate) fn rejected(from: UserId, reason: RejectReason) -> Self {
        let reason = match reason {
            RejectReason::Busy => "busy",
        };
        ClientEvent::CallRejected(CallRejectedPayload {
            from,
            reason: reason.to_string(),
        })
    }
}

impl From<&CallState> for CallStatePayload {
    fn from(state: &CallState) -> Self {
        let (name, message) = match state {
            CallState::Idle => ("idle", None),
            CallState::RequestingMedia { .. } => ("requesting-media", None),
            CallState::Negotiating { .. } => ("negotiating", None),
            CallState::Connected { .. } => ("connected", None),
            CallState::Failed { reason, .. } => ("failed", Some(reason.user_message().to_string())),
            CallState::Ended => ("ended", None),
        };
        Self {
            state: name.to_string(),
            peer: state.peer().cloned(),
            message,
        }
    }
}

impl From<CallEvent> for ClientEvent {
    fn from(event: CallEvent) -> Self {
        match event {
            CallEvent::StateChanged(state) => ClientEvent::CallStateChanged((&state).into()),
            CallEvent::Rejected { from, reason } => ClientEvent::rejected(from, reason),
            CallEvent::RemoteTrack { kind, id } => ClientEvent::CallTrack(TrackPayload {
                kind: kind.to_string(),
                remote: true,
                id: Some(id),
                enabled: None,
            }),
            CallEvent::TrackToggled { kind, enabled } => ClientEvent::CallTrack(TrackPayload {
                kind: kind.to_string(),
                remote: false,
                id: None,
                enabled: Some(enabled),
            }),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

pub fn emit_event(events: &EventSender, event: ClientEvent) {
    let name = event.name();
    if let Err(e) = events.send(event) {
        tracing::error!(event = name, error = %e, "Failed to emit event");
    }
}
