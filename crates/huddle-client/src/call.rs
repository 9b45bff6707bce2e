//! Call controller: runs a [`CallSession`] on its own channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use huddle_media::{CallConfig, CallSession, CallState, MediaDevices, PeerConnectionFactory};
use huddle_net::{dispatch, recv_from, Channel, ChannelEvent};
use huddle_shared::error::{CallError, ChannelError};
use huddle_shared::types::UserId;

use crate::context::SessionContext;
use crate::events::{emit_event, ClientEvent, EventSender};
use crate::notifier::IncomingCallRecord;

enum CallCommand {
    Start {
        peer: UserId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        record: IncomingCallRecord,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup,
    ToggleAudio {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    State {
        reply: oneshot::Sender<CallState>,
    },
    Shutdown,
}

/// Handle to a running call controller. Dropping it stops the task.
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub async fn start(&self, peer: UserId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Start { peer, reply }, rx).await?
    }

    /// Take the callee path for a record handed over by the notifier.
    pub async fn accept(&self, record: IncomingCallRecord) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Accept { record, reply }, rx).await?
    }

    pub async fn hangup(&self) {
        let _ = self.commands.send(CallCommand::Hangup).await;
    }

    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::ToggleAudio { reply }, rx).await?
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::ToggleVideo { reply }, rx).await?
    }

    pub async fn state(&self) -> CallState {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::State { reply }, rx)
            .await
            .unwrap_or(CallState::Idle)
    }

    /// Hang up any active call and close the channel.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(CallCommand::Shutdown).await;
        let _ = (&mut self.task).await;
    }

    async fn request<T>(
        &self,
        command: CallCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::Channel(ChannelError::NotConnected))?;
        rx.await
            .map_err(|_| CallError::Channel(ChannelError::NotConnected))
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Mount the call controller. Fails if its channel cannot be opened.
pub async fn spawn_call(
    ctx: SessionContext,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: CallConfig,
    events: EventSender,
) -> Result<CallHandle, CallError> {
    let first = Channel::open(ctx.transports.as_ref(), &ctx.identity).await?;
    let (call_tx, mut call_rx) = mpsc::unbounded_channel();
    let (commands, mut command_rx) = mpsc::channel(16);

    let mut session = CallSession::new(
        ctx.identity.clone(),
        first.sender(),
        devices,
        peers,
        config,
        ctx.call_activity.clone(),
        call_tx,
    );

    let task = tokio::spawn(async move {
        let mut channel = Some(first);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else { break };
                    if channel.is_none()
                        && matches!(command, CallCommand::Start { .. } | CallCommand::Accept { .. })
                    {
                        channel = ctx.open_channel("call").await;
                        if let Some(ch) = channel.as_ref() {
                            session.set_signaling(ch.sender());
                        }
                    }

                    match command {
                        CallCommand::Start { peer, reply } => {
                            let _ = reply.send(session.start_call(peer).await);
                        }
                        CallCommand::Accept { record, reply } => {
                            let result = session
                                .accept_offer(record.caller, record.offer, record.candidates)
                                .await;
                            let _ = reply.send(result);
                        }
                        CallCommand::Hangup => session.hangup().await,
                        CallCommand::ToggleAudio { reply } => {
                            let _ = reply.send(session.toggle_audio());
                        }
                        CallCommand::ToggleVideo { reply } => {
                            let _ = reply.send(session.toggle_video());
                        }
                        CallCommand::State { reply } => {
                            let _ = reply.send(session.state().clone());
                        }
                        CallCommand::Shutdown => break,
                    }
                }

                event = recv_from(&mut channel) => {
                    match event {
                        ChannelEvent::Frame(frame) => dispatch(frame, &mut session).await,
                        ChannelEvent::Closed { reason } => {
                            warn!(?reason, "Call channel closed");
                            channel = None;
                        }
                    }
                }

                event = session.next_peer_event() => {
                    session.handle_peer_event(event).await;
                }
            }

            forward(&mut call_rx, &events);
        }

        if !session.state().is_idle() {
            session.hangup().await;
        }
        forward(&mut call_rx, &events);
        if let Some(ch) = channel.take() {
            ch.close().await;
        }
        info!("Call controller stopped");
    });

    Ok(CallHandle { commands, task })
}

/// Emit everything the session produced during the last step.
fn forward(call_rx: &mut mpsc::UnboundedReceiver<huddle_media::CallEvent>, events: &EventSender) {
    while let Ok(event) = call_rx.try_recv() {
        emit_event(events, ClientEvent::from(event));
    }
}
