//! Incoming-call notifier.
//!
//! Listens on its own channel for offers that arrive while no call is
//! running and turns them into a pending [`IncomingCallRecord`] the user can
//! accept or reject.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use huddle_media::{CallActivity, RejectReason};
use huddle_net::{dispatch, recv_from, ChannelEvent, Directory, FrameHandler};
use huddle_shared::constants::NOTIFICATION_GRACE;
use huddle_shared::protocol::{IceCandidate, SessionDescription};
use huddle_shared::types::{DisplayProfile, UserId};

use crate::context::SessionContext;
use crate::events::{emit_event, ClientEvent, EventSender, IncomingCallPayload};

/// An undecided incoming call.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCallRecord {
    pub caller: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub offer: SessionDescription,
    /// Candidates that arrived before the call was accepted.
    pub candidates: Vec<IceCandidate>,
}

pub struct NotifierState {
    identity: UserId,
    activity: CallActivity,
    directory: Arc<dyn Directory>,
    pending: Option<IncomingCallRecord>,
    grace: Option<Instant>,
    events: EventSender,
}

impl NotifierState {
    pub fn new(
        identity: UserId,
        activity: CallActivity,
        directory: Arc<dyn Directory>,
        events: EventSender,
    ) -> Self {
        Self {
            identity,
            activity,
            directory,
            pending: None,
            grace: None,
            events,
        }
    }

    pub fn pending(&self) -> Option<&IncomingCallRecord> {
        self.pending.as_ref()
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace
    }

    /// Hand the pending record over to the call controller.
    pub fn accept(&mut self) -> Option<IncomingCallRecord> {
        self.grace = None;
        let record = self.pending.take()?;
        info!(caller = %record.caller.short(), "Incoming call accepted");
        self.emit_cleared(&record.caller);
        Some(record)
    }

    /// Discard the pending record. Nothing is sent to the caller.
    pub fn reject(&mut self) -> bool {
        self.grace = None;
        match self.pending.take() {
            Some(record) => {
                info!(caller = %record.caller.short(), "Incoming call rejected");
                self.emit_cleared(&record.caller);
                true
            }
            None => false,
        }
    }

    pub fn call_ui_opened(&mut self) {
        self.grace = None;
    }

    pub fn call_ui_closed(&mut self, now: Instant) {
        if self.pending.is_some() {
            self.grace = Some(now + NOTIFICATION_GRACE);
        }
    }

    /// Clear an undecided record once the grace deadline has passed.
    pub fn grace_expired(&mut self, now: Instant) {
        if !self.grace.is_some_and(|at| at <= now) {
            return;
        }
        self.grace = None;
        if let Some(record) = self.pending.take() {
            debug!(caller = %record.caller.short(), "Incoming call dismissed");
            self.emit_cleared(&record.caller);
        }
    }

    async fn display_profile(&self, caller: &UserId) -> DisplayProfile {
        match self.directory.profile(caller).await {
            Ok(profile) => DisplayProfile::from_profile(profile, caller.as_str()),
            Err(e) => {
                debug!(caller = %caller.short(), error = %e, "Caller profile unavailable");
                DisplayProfile::raw(caller)
            }
        }
    }

    fn emit_cleared(&self, caller: &UserId) {
        emit_event(
            &self.events,
            ClientEvent::IncomingCallCleared {
                caller: caller.clone(),
            },
        );
    }
}

#[async_trait]
impl FrameHandler for NotifierState {
    async fn on_offer(&mut self, sender_id: UserId, offer: SessionDescription) {
        if sender_id == self.identity {
            return;
        }
        if self.activity.is_active() {
            debug!(from = %sender_id.short(), "Call active, offer left to the call controller");
            return;
        }

        let pending_caller = self.pending.as_ref().map(|r| r.caller.clone());
        match pending_caller {
            Some(caller) if caller == sender_id => {
                debug!(caller = %sender_id.short(), "Replacing pending offer");
                if let Some(record) = self.pending.as_mut() {
                    record.offer = offer;
                }
            }
            Some(caller) => {
                warn!(
                    caller = %caller.short(),
                    from = %sender_id.short(),
                    "Second caller while a call is pending, rejecting"
                );
                emit_event(&self.events, ClientEvent::rejected(sender_id, RejectReason::Busy));
            }
            None => {
                let profile = self.display_profile(&sender_id).await;
                info!(caller = %sender_id.short(), name = %profile.display_name, "Incoming call");
                emit_event(
                    &self.events,
                    ClientEvent::IncomingCall(IncomingCallPayload {
                        caller: sender_id.clone(),
                        display_name: profile.display_name.clone(),
                        avatar: profile.avatar.clone(),
                    }),
                );
                self.pending = Some(IncomingCallRecord {
                    caller: sender_id,
                    display_name: profile.display_name,
                    avatar: profile.avatar,
                    offer,
                    candidates: Vec::new(),
                });
            }
        }
    }

    async fn on_ice_candidate(&mut self, sender_id: UserId, candidate: IceCandidate) {
        if let Some(record) = self.pending.as_mut().filter(|r| r.caller == sender_id) {
            record.candidates.push(candidate);
        }
    }
}

enum NotifierCommand {
    Pending {
        reply: oneshot::Sender<Option<IncomingCallRecord>>,
    },
    Accept {
        reply: oneshot::Sender<Option<IncomingCallRecord>>,
    },
    Reject,
    UiOpened,
    UiClosed,
    Shutdown,
}

/// Handle to a running notifier. Dropping it stops the task.
pub struct NotifierHandle {
    commands: mpsc::Sender<NotifierCommand>,
    task: JoinHandle<()>,
}

impl NotifierHandle {
    pub async fn pending(&self) -> Option<IncomingCallRecord> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(NotifierCommand::Pending { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn accept(&self) -> Option<IncomingCallRecord> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(NotifierCommand::Accept { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn reject(&self) {
        let _ = self.commands.send(NotifierCommand::Reject).await;
    }

    pub async fn call_ui_opened(&self) {
        let _ = self.commands.send(NotifierCommand::UiOpened).await;
    }

    pub async fn call_ui_closed(&self) {
        let _ = self.commands.send(NotifierCommand::UiClosed).await;
    }

    pub async fn shutdown(mut self) {
        let _ = self.commands.send(NotifierCommand::Shutdown).await;
        let _ = (&mut self.task).await;
    }
}

impl Drop for NotifierHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_notifier(ctx: SessionContext, events: EventSender) -> NotifierHandle {
    let (commands, mut command_rx) = mpsc::channel(16);

    let task = tokio::spawn(async move {
        let mut channel = ctx.open_channel("notifier").await;
        let mut state = NotifierState::new(
            ctx.identity.clone(),
            ctx.call_activity.clone(),
            ctx.directory.clone(),
            events,
        );

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(NotifierCommand::Pending { reply }) => {
                            let _ = reply.send(state.pending().cloned());
                        }
                        Some(NotifierCommand::Accept { reply }) => {
                            let _ = reply.send(state.accept());
                        }
                        Some(NotifierCommand::Reject) => {
                            state.reject();
                        }
                        Some(NotifierCommand::UiOpened) => state.call_ui_opened(),
                        Some(NotifierCommand::UiClosed) => state.call_ui_closed(Instant::now()),
                        Some(NotifierCommand::Shutdown) | None => break,
                    }
                }

                event = recv_from(&mut channel) => {
                    match event {
                        ChannelEvent::Frame(frame) => dispatch(frame, &mut state).await,
                        ChannelEvent::Closed { reason } => {
                            warn!(?reason, "Notifier channel closed");
                            channel = None;
                        }
                    }
                }

                _ = crate::sleep_until(state.grace_deadline()) => {
                    state.grace_expired(Instant::now());
                }
            }
        }

        if let Some(ch) = channel.take() {
            ch.close().await;
        }
        info!("Notifier stopped");
    });

    NotifierHandle { commands, task }
}
