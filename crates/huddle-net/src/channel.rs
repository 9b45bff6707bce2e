//! Per-identity real-time channel.
//!
//! A [`Channel`] wraps one transport connection. Inbound text is routed into
//! typed [`InboundFrame`]s as it is received; malformed frames are logged and
//! skipped. Outbound frames go through a cloneable [`ChannelSender`] so a
//! component can hand the send side to helpers while its own select loop
//! keeps the receive side.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_shared::error::ChannelError;
use huddle_shared::protocol::{InboundFrame, OutboundFrame};
use huddle_shared::types::UserId;

use crate::router;
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// What a channel yields to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(InboundFrame),
    /// The connection dropped. Reported once; the channel is exhausted after.
    Closed { reason: Option<String> },
}

/// Send side of a channel.
#[derive(Clone)]
pub struct ChannelSender {
    identity: UserId,
    transport: Arc<dyn Transport>,
}

impl ChannelSender {
    /// Serialize and send one frame. Fails with [`ChannelError::NotConnected`]
    /// instead of dropping when the transport is closed.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), ChannelError> {
        if !self.transport.is_open() {
            debug!(identity = %self.identity.short(), "Send on closed channel");
            return Err(ChannelError::NotConnected);
        }

        let text = frame
            .to_json()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.transport.send_text(text).await
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("identity", &self.identity)
            .field("open", &self.transport.is_open())
            .finish()
    }
}

pub struct Channel {
    sender: ChannelSender,
    events: mpsc::Receiver<TransportEvent>,
    exhausted: bool,
}

impl Channel {
    /// Dial the endpoint for `identity`.
    pub async fn open(
        factory: &dyn TransportFactory,
        identity: &UserId,
    ) -> Result<Self, ChannelError> {
        let (transport, events) = factory.connect(identity).await?;
        info!(identity = %identity.short(), "Channel open");

        Ok(Self {
            sender: ChannelSender {
                identity: identity.clone(),
                transport,
            },
            events,
            exhausted: false,
        })
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn identity(&self) -> &UserId {
        &self.sender.identity
    }

    pub fn is_open(&self) -> bool {
        !self.exhausted && self.sender.is_open()
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), ChannelError> {
        self.sender.send(frame).await
    }

    /// Next routed frame, in arrival order. Returns `Closed` once when the
    /// connection drops and `None` from then on.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.exhausted {
            return None;
        }

        loop {
            match self.events.recv().await {
                Some(TransportEvent::Frame(text)) => match router::route(&text) {
                    Ok(frame) => {
                        debug!(kind = frame.kind(), "<-- frame");
                        return Some(ChannelEvent::Frame(frame));
                    }
                    Err(e) => {
                        warn!(error = %e, len = text.len(), "Dropping malformed frame");
                    }
                },
                Some(TransportEvent::Closed { reason }) => {
                    self.exhausted = true;
                    info!(identity = %self.identity().short(), reason = ?reason, "Channel closed");
                    return Some(ChannelEvent::Closed { reason });
                }
                None => {
                    self.exhausted = true;
                    return Some(ChannelEvent::Closed { reason: None });
                }
            }
        }
    }

    /// Close the transport and drop the receive side.
    pub async fn close(self) {
        self.sender.transport.close().await;
        debug!(identity = %self.identity().short(), "Channel released");
    }
}

/// Receive from an optional channel. Stays pending while there is no channel
/// or the channel is exhausted, so it can sit in a `select!` arm.
pub async fn recv_from(channel: &mut Option<Channel>) -> ChannelEvent {
    if let Some(channel) = channel.as_mut() {
        if let Some(event) = channel.recv().await {
            return event;
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransportFactory;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_arrive_in_order_and_malformed_are_skipped() {
        let factory = MemoryTransportFactory::new();
        let mut channel = Channel::open(&factory, &UserId::from("me")).await.unwrap();
        let link = factory.last_link().unwrap();

        link.push_json(json!({"type": "typing_status", "sender_id": "b", "is_typing": true}));
        link.push_frame("{garbage");
        link.push_json(json!({"type": "who_knows"}));
        link.push_json(json!({"type": "messages_read", "message_ids": [1, 2]}));

        match channel.recv().await {
            Some(ChannelEvent::Frame(InboundFrame::TypingStatus { is_typing, .. })) => {
                assert!(is_typing)
            }
            other => panic!("unexpected {other:?}"),
        }
        match channel.recv().await {
            Some(ChannelEvent::Frame(InboundFrame::MessagesRead { message_ids })) => {
                assert_eq!(message_ids.len(), 2)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_drop_is_not_connected() {
        let factory = MemoryTransportFactory::new();
        let mut channel = Channel::open(&factory, &UserId::from("me")).await.unwrap();
        let link = factory.last_link().unwrap();
        let sender = channel.sender();

        let frame = OutboundFrame::TypingStart {
            receiver_id: "b".into(),
        };
        sender.send(&frame).await.unwrap();
        assert_eq!(link.sent_json().len(), 1);

        link.drop_connection();
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Closed { reason: None })
        );
        assert_eq!(channel.recv().await, None);
        assert_eq!(sender.send(&frame).await, Err(ChannelError::NotConnected));
        assert_eq!(link.sent_json().len(), 1);
    }

    #[tokio::test]
    async fn test_open_fails_when_refused() {
        let factory = MemoryTransportFactory::new();
        factory.set_refuse(true);
        assert!(Channel::open(&factory, &UserId::from("me")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_shuts_transport() {
        let factory = MemoryTransportFactory::new();
        let channel = Channel::open(&factory, &UserId::from("me")).await.unwrap();
        let link = factory.last_link().unwrap();
        let sender = channel.sender();

        channel.close().await;
        assert!(!link.is_open());
        assert!(!sender.is_open());
    }
}
