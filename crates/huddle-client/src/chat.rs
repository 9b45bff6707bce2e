//! One-to-one chat with optimistic sends and typing indicators.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use huddle_net::{dispatch, recv_from, Channel, ChannelEvent, ChannelSender, Directory, FrameHandler};
use huddle_shared::constants::{RECONCILE_WINDOW, TYPING_IDLE};
use huddle_shared::error::{ChannelError, ChatError};
use huddle_shared::message::{ChatMessage, MessageBody, MessageStatus};
use huddle_shared::protocol::OutboundFrame;
use huddle_shared::types::{MessageId, UserId};

use crate::context::SessionContext;
use crate::events::{emit_event, ClientEvent, ConversationPayload, EventSender, TypingPayload};

/// What the user composed. A sticker wins over text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub sticker: Option<String>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sticker: None,
        }
    }

    pub fn sticker(id: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            sticker: Some(id.into()),
        }
    }

    /// `None` when there is nothing worth sending.
    pub fn into_body(self) -> Option<MessageBody> {
        let body = match self.sticker.filter(|s| !s.is_empty()) {
            Some(id) => MessageBody::Sticker(id),
            None => MessageBody::Text(self.text),
        };
        (!body.is_blank()).then_some(body)
    }
}

/// Local typing state: started on the first keystroke, stopped after
/// [`TYPING_IDLE`] without one.
#[derive(Debug, Default)]
pub struct TypingIndicator {
    deadline: Option<Instant>,
}

impl TypingIndicator {
    /// Returns `true` when `typing_start` has to be sent.
    pub fn on_keystroke(&mut self, now: Instant) -> bool {
        let started = self.deadline.is_none();
        self.deadline = Some(now + TYPING_IDLE);
        started
    }

    /// Returns `true` when the idle deadline passed and `typing_stop` is due.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if the indicator was active.
    pub fn stop(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }
}

pub struct ChatSession {
    identity: UserId,
    peer: Option<UserId>,
    messages: Vec<ChatMessage>,
    peer_typing: bool,
    typing: TypingIndicator,
    signaling: Option<ChannelSender>,
    events: EventSender,
}

impl ChatSession {
    pub fn new(identity: UserId, signaling: Option<ChannelSender>, events: EventSender) -> Self {
        Self {
            identity,
            peer: None,
            messages: Vec::new(),
            peer_typing: false,
            typing: TypingIndicator::default(),
            signaling,
            events,
        }
    }

    pub fn set_signaling(&mut self, signaling: Option<ChannelSender>) {
        self.signaling = signaling;
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.peer.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    /// Switch the open conversation.
    pub async fn select_peer(&mut self, peer: UserId) {
        if self.typing.stop() {
            self.send_typing(false).await;
        }
        debug!(peer = %peer.short(), "Conversation selected");
        self.peer = Some(peer);
        self.messages.clear();
        self.peer_typing = false;
        self.emit_conversation();
    }

    /// Fetch the conversation and mark everything addressed to us as read.
    pub async fn load_history(&mut self, directory: &dyn Directory) -> Result<(), ChatError> {
        let peer = self.peer.clone().ok_or(ChatError::NoRecipientSelected)?;
        self.messages = directory.history(&self.identity, &peer).await?;

        let unread: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|m| m.receiver_id == self.identity && m.status != MessageStatus::Read)
            .filter_map(|m| m.id)
            .collect();

        if !unread.is_empty() {
            match directory.update_status(&unread, MessageStatus::Read).await {
                Ok(()) => {
                    for message in self.messages.iter_mut() {
                        if message.id.is_some_and(|id| unread.contains(&id)) {
                            let _ = message.advance_status(MessageStatus::Read);
                        }
                    }
                }
                Err(e) => warn!(error = %e, count = unread.len(), "Could not mark messages read"),
            }
        }

        info!(peer = %peer.short(), count = self.messages.len(), "History loaded");
        self.emit_conversation();
        Ok(())
    }

    /// A key was pressed in the composer.
    pub async fn keystroke(&mut self, now: Instant) {
        if self.peer.is_none() {
            return;
        }
        if self.typing.on_keystroke(now) {
            self.send_typing(true).await;
        }
    }

    /// Called when the typing deadline fires.
    pub async fn typing_expired(&mut self, now: Instant) {
        if self.typing.poll(now) {
            self.send_typing(false).await;
        }
    }

    pub async fn send(&mut self, draft: Draft) -> Result<(), ChatError> {
        let Some(body) = draft.into_body() else {
            return Ok(());
        };
        let peer = self.peer.clone().ok_or(ChatError::NoRecipientSelected)?;

        self.messages.push(ChatMessage::optimistic(
            self.identity.clone(),
            peer.clone(),
            body.clone(),
        ));
        let index = self.messages.len() - 1;
        self.emit_conversation();

        if self.typing.stop() {
            self.send_typing(false).await;
        }

        let frame = OutboundFrame::Message {
            receiver_id: peer.clone(),
            body,
        };
        if let Err(e) = self.transmit(&frame).await {
            warn!(peer = %peer.short(), error = %e, "Message not sent, withdrawing");
            self.messages.remove(index);
            self.emit_conversation();
            return Err(e.into());
        }
        Ok(())
    }

    /// Update, replace or append an inbound message of the open conversation.
    fn reconcile(&mut self, message: ChatMessage) {
        if let Some(id) = message.id {
            if let Some(existing) = self.messages.iter_mut().find(|m| m.id == Some(id)) {
                if let Err(e) = existing.advance_status(message.status) {
                    debug!(id = id.0, error = %e, "Ignoring stale status");
                }
                return;
            }
        }

        if message.sender_id == self.identity {
            let window = RECONCILE_WINDOW.as_millis() as i64;
            let echo_of = self.messages.iter().position(|m| {
                m.is_optimistic()
                    && m.receiver_id == message.receiver_id
                    && m.body == message.body
                    && (message.timestamp - m.timestamp).num_milliseconds().abs() <= window
            });
            if let Some(index) = echo_of {
                self.messages[index] = message;
                return;
            }
        }

        self.messages.push(message);
    }

    async fn send_typing(&self, typing: bool) {
        let Some(receiver_id) = self.peer.clone() else {
            return;
        };
        let frame = if typing {
            OutboundFrame::TypingStart { receiver_id }
        } else {
            OutboundFrame::TypingStop { receiver_id }
        };
        if let Err(e) = self.transmit(&frame).await {
            debug!(error = %e, "Typing indicator not sent");
        }
    }

    async fn transmit(&self, frame: &OutboundFrame) -> Result<(), ChannelError> {
        match &self.signaling {
            Some(sender) => sender.send(frame).await,
            None => Err(ChannelError::NotConnected),
        }
    }

    fn emit_conversation(&self) {
        emit_event(
            &self.events,
            ClientEvent::ConversationChanged(ConversationPayload {
                peer: self.peer.clone(),
                messages: self.messages.clone(),
            }),
        );
    }
}

#[async_trait]
impl FrameHandler for ChatSession {
    async fn on_message(&mut self, message: ChatMessage) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if !message.is_between(&self.identity, peer) {
            debug!(from = %message.sender_id.short(), "Message for another conversation dropped");
            return;
        }
        self.reconcile(message);
        self.emit_conversation();
    }

    async fn on_typing_status(&mut self, sender_id: UserId, is_typing: bool) {
        if self.peer.as_ref() != Some(&sender_id) {
            return;
        }
        self.peer_typing = is_typing;
        emit_event(
            &self.events,
            ClientEvent::PeerTyping(TypingPayload {
                peer: sender_id,
                is_typing,
            }),
        );
    }

    async fn on_messages_read(&mut self, message_ids: Vec<MessageId>) {
        let mut changed = false;
        for message in self.messages.iter_mut() {
            let listed = message.id.is_some_and(|id| message_ids.contains(&id));
            if listed && message.sender_id == self.identity {
                changed |= message.advance_status(MessageStatus::Read).unwrap_or(false);
            }
        }
        if changed {
            self.emit_conversation();
        }
    }
}

enum ChatCommand {
    Open {
        peer: UserId,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Keystroke,
    Send {
        draft: Draft,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Messages {
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    Shutdown,
}

/// Handle to a running chat component. Dropping it stops the task.
pub struct ChatHandle {
    commands: mpsc::Sender<ChatCommand>,
    task: JoinHandle<()>,
}

impl ChatHandle {
    /// Select `peer` and load the conversation.
    pub async fn open(&self, peer: UserId) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(ChatCommand::Open { peer, reply }, rx).await?
    }

    pub async fn keystroke(&self) {
        let _ = self.commands.send(ChatCommand::Keystroke).await;
    }

    pub async fn send(&self, draft: Draft) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(ChatCommand::Send { draft, reply }, rx).await?
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        let (reply, rx) = oneshot::channel();
        self.request(ChatCommand::Messages { reply }, rx)
            .await
            .unwrap_or_default()
    }

    pub async fn shutdown(mut self) {
        let _ = self.commands.send(ChatCommand::Shutdown).await;
        let _ = (&mut self.task).await;
    }

    async fn request<T>(
        &self,
        command: ChatCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ChatError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::Channel(ChannelError::NotConnected))?;
        rx.await
            .map_err(|_| ChatError::Channel(ChannelError::NotConnected))
    }
}

impl Drop for ChatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Mount the chat component with its own channel.
pub fn spawn_chat(ctx: SessionContext, events: EventSender) -> ChatHandle {
    let (commands, mut command_rx) = mpsc::channel(32);

    let task = tokio::spawn(async move {
        let mut channel = ctx.open_channel("chat").await;
        let mut session = ChatSession::new(
            ctx.identity.clone(),
            channel.as_ref().map(Channel::sender),
            events,
        );

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else { break };
                    if channel.is_none() && matches!(command, ChatCommand::Open { .. } | ChatCommand::Send { .. }) {
                        channel = ctx.open_channel("chat").await;
                        session.set_signaling(channel.as_ref().map(Channel::sender));
                    }
                    match command {
                        ChatCommand::Open { peer, reply } => {
                            session.select_peer(peer).await;
                            let _ = reply.send(session.load_history(ctx.directory.as_ref()).await);
                        }
                        ChatCommand::Keystroke => session.keystroke(Instant::now()).await,
                        ChatCommand::Send { draft, reply } => {
                            let _ = reply.send(session.send(draft).await);
                        }
                        ChatCommand::Messages { reply } => {
                            let _ = reply.send(session.messages().to_vec());
                        }
                        ChatCommand::Shutdown => break,
                    }
                }

                event = recv_from(&mut channel) => {
                    match event {
                        ChannelEvent::Frame(frame) => dispatch(frame, &mut session).await,
                        ChannelEvent::Closed { reason } => {
                            warn!(?reason, "Chat channel closed");
                            channel = None;
                            session.set_signaling(None);
                        }
                    }
                }

                _ = crate::sleep_until(session.typing_deadline()) => {
                    session.typing_expired(Instant::now()).await;
                }
            }
        }

        if session.typing.stop() {
            session.send_typing(false).await;
        }
        if let Some(ch) = channel.take() {
            ch.close().await;
        }
        info!("Chat stopped");
    });

    ChatHandle { commands, task }
}
