//! Call signaling state machine.
//!
//! One [`CallSession`] per call controller drives a single two-party call
//! through offer / answer / ICE exchange. It never runs a task of its own:
//! the owner feeds it commands, inbound signaling frames (it is a
//! [`FrameHandler`]) and [`PeerEvent`]s, and observes it through
//! [`CallEvent`]s.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use huddle_net::{ChannelSender, FrameHandler};
use huddle_shared::error::{CallError, MediaError};
use huddle_shared::protocol::{IceCandidate, OutboundFrame, SessionDescription};
use huddle_shared::types::UserId;

use crate::devices::{LocalMedia, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::{Connectivity, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a call ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// Devices could not be acquired or the local negotiation step failed.
    Media(MediaError),
    /// Connectivity was lost while negotiating or connected.
    NegotiationLost,
}

impl CallFailure {
    pub fn user_message(&self) -> &'static str {
        match self {
            CallFailure::Media(e) => e.user_message(),
            CallFailure::NegotiationLost => "The call connection was lost.",
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Media(e) => write!(f, "{e}"),
            CallFailure::NegotiationLost => f.write_str("negotiation lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    RequestingMedia { role: CallRole, peer: UserId },
    Negotiating { role: CallRole, peer: UserId },
    Connected { role: CallRole, peer: UserId },
    Failed { peer: UserId, reason: CallFailure },
    Ended,
}

impl CallState {
    pub fn peer(&self) -> Option<&UserId> {
        match self {
            CallState::RequestingMedia { peer, .. }
            | CallState::Negotiating { peer, .. }
            | CallState::Connected { peer, .. }
            | CallState::Failed { peer, .. } => Some(peer),
            CallState::Idle | CallState::Ended => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    /// An offer arrived from someone else while a call was active.
    Rejected { from: UserId, reason: RejectReason },
    RemoteTrack { kind: TrackKind, id: String },
    TrackToggled { kind: TrackKind, enabled: bool },
}

/// Shared "a call is in progress" flag, readable by components that do not
/// own the call.
#[derive(Debug, Clone, Default)]
pub struct CallActivity(Arc<AtomicBool>);

impl CallActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub peer: PeerConfig,
    pub constraints: MediaConstraints,
    /// Take the callee path for any offer that arrives while idle.
    pub auto_answer: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            constraints: MediaConstraints::default(),
            auto_answer: false,
        }
    }
}

struct ActiveCall {
    connection: Arc<dyn PeerConnection>,
    peer_events: mpsc::Receiver<PeerEvent>,
    media: LocalMedia,
}

pub struct CallSession {
    identity: UserId,
    signaling: ChannelSender,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: CallConfig,
    activity: CallActivity,
    events: mpsc::UnboundedSender<CallEvent>,
    state: CallState,
    active: Option<ActiveCall>,
    remote_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl CallSession {
    pub fn new(
        identity: UserId,
        signaling: ChannelSender,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: CallConfig,
        activity: CallActivity,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            identity,
            signaling,
            devices,
            peers,
            config,
            activity,
            events,
            state: CallState::Idle,
            active: None,
            remote_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    /// Swap the signaling channel, e.g. after the owner reconnected.
    pub fn set_signaling(&mut self, signaling: ChannelSender) {
        self.signaling = signaling;
    }

    /// Caller path: acquire media, create the offer and send it to `peer`.
    pub async fn start_call(&mut self, peer: UserId) -> Result<(), CallError> {
        if !self.state.is_idle() {
            return Err(CallError::CallAlreadyActive);
        }
        info!(peer = %peer.short(), "Starting call");

        self.set_state(CallState::RequestingMedia {
            role: CallRole::Caller,
            peer: peer.clone(),
        });

        let media = match self.devices.acquire(self.config.constraints).await {
            Ok(media) => media,
            Err(e) => return Err(self.fail_media(peer, e).await),
        };

        if let Err(e) = self.open_connection(media).await {
            return Err(self.fail_media(peer, e).await);
        }

        let offer = match self.local_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail_media(peer, e).await),
        };

        let frame = OutboundFrame::WebrtcOffer {
            target_id: peer.clone(),
            offer,
        };
        if let Err(e) = self.signaling.send(&frame).await {
            warn!(peer = %peer.short(), error = %e, "Could not send offer");
            self.release().await;
            self.set_state(CallState::Idle);
            return Err(CallError::Channel(e));
        }

        self.set_state(CallState::Negotiating {
            role: CallRole::Caller,
            peer,
        });
        Ok(())
    }

    /// Callee path for an offer from `from`. `early_candidates` are ICE
    /// candidates that arrived with the offer before the call was accepted.
    pub async fn accept_offer(
        &mut self,
        from: UserId,
        offer: SessionDescription,
        early_candidates: Vec<IceCandidate>,
    ) -> Result<(), CallError> {
        if !self.state.is_idle() {
            return Err(CallError::CallAlreadyActive);
        }
        info!(peer = %from.short(), "Accepting call");

        self.set_state(CallState::RequestingMedia {
            role: CallRole::Callee,
            peer: from.clone(),
        });
        self.pending_candidates.extend(early_candidates);

        let media = match self.devices.acquire(self.config.constraints).await {
            Ok(media) => media,
            Err(e) => return Err(self.fail_media(from, e).await),
        };

        if let Err(e) = self.open_connection(media).await {
            return Err(self.fail_media(from, e).await);
        }

        let answer = match self.local_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_media(from, e).await),
        };

        let frame = OutboundFrame::WebrtcAnswer {
            target_id: from.clone(),
            answer,
        };
        if let Err(e) = self.signaling.send(&frame).await {
            warn!(peer = %from.short(), error = %e, "Could not send answer");
            self.release().await;
            self.set_state(CallState::Idle);
            return Err(CallError::Channel(e));
        }

        self.set_state(CallState::Negotiating {
            role: CallRole::Callee,
            peer: from,
        });
        Ok(())
    }

    /// Leave the call from any state.
    pub async fn hangup(&mut self) {
        if let Some(peer) = self.state.peer() {
            info!(peer = %peer.short(), "Hanging up");
        }
        self.release().await;
        self.set_state(CallState::Ended);
        self.set_state(CallState::Idle);
    }

    pub fn toggle_audio(&mut self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let active = self.active.as_ref().ok_or(CallError::NotInCall)?;
        let enabled = active.media.toggle(kind).ok_or(CallError::NotInCall)?;
        debug!(%kind, enabled, "Toggled local track");
        self.emit(CallEvent::TrackToggled { kind, enabled });
        Ok(enabled)
    }

    /// Next event from the live peer connection. Pending while there is none,
    /// so it can sit in a `select!` arm.
    pub async fn next_peer_event(&mut self) -> PeerEvent {
        if let Some(active) = self.active.as_mut() {
            if let Some(event) = active.peer_events.recv().await {
                return event;
            }
        }
        std::future::pending().await
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(peer) = self.state.peer().cloned() else {
            debug!(?event, "Peer event without a call");
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let frame = OutboundFrame::WebrtcIceCandidate {
                    target_id: peer.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(&frame).await {
                    warn!(peer = %peer.short(), error = %e, "Could not send ICE candidate");
                }
            }
            PeerEvent::Connectivity(Connectivity::Connected) => match &self.state {
                CallState::Negotiating { role, peer } if self.remote_set => {
                    info!(peer = %peer.short(), ?role, "Call connected");
                    let next = CallState::Connected {
                        role: *role,
                        peer: peer.clone(),
                    };
                    self.set_state(next);
                }
                CallState::Negotiating { .. } => {
                    debug!("Connectivity before remote description, ignoring");
                }
                _ => {}
            },
            PeerEvent::Connectivity(Connectivity::Failed | Connectivity::Disconnected) => {
                if matches!(
                    self.state,
                    CallState::Negotiating { .. } | CallState::Connected { .. }
                ) {
                    warn!(peer = %peer.short(), "Peer connectivity lost");
                    self.fail(peer, CallFailure::NegotiationLost).await;
                }
            }
            PeerEvent::Connectivity(state) => {
                debug!(?state, "Peer connectivity changed");
            }
            PeerEvent::RemoteTrack { kind, id } => {
                debug!(%kind, "Remote track");
                self.emit(CallEvent::RemoteTrack { kind, id });
            }
        }
    }

    async fn open_connection(&mut self, media: LocalMedia) -> Result<(), MediaError> {
        let (connection, peer_events) = self.peers.create(&self.config.peer).await?;
        self.remote_set = false;
        // Stored before adding tracks so a failure below still releases it.
        let active = self.active.insert(ActiveCall {
            connection,
            peer_events,
            media,
        });
        active.connection.add_local_tracks(&active.media).await
    }

    fn connection(&self) -> Result<Arc<dyn PeerConnection>, MediaError> {
        self.active
            .as_ref()
            .map(|a| a.connection.clone())
            .ok_or_else(|| MediaError::Negotiation("no peer connection".into()))
    }

    async fn local_offer(&mut self) -> Result<SessionDescription, MediaError> {
        let connection = self.connection()?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn local_answer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        let connection = self.connection()?;
        connection.set_remote_description(offer).await?;
        self.remote_set = true;
        self.flush_candidates(&connection).await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn flush_candidates(&mut self, connection: &Arc<dyn PeerConnection>) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(error = %e, "Failed to apply buffered ICE candidate");
            }
        }
    }

    async fn fail_media(&mut self, peer: UserId, error: MediaError) -> CallError {
        warn!(peer = %peer.short(), error = %error, "Call setup failed");
        self.fail(peer, CallFailure::Media(error.clone())).await;
        CallError::Media(error)
    }

    /// Surface `Failed`, release everything and return to `Idle`.
    async fn fail(&mut self, peer: UserId, reason: CallFailure) {
        self.release().await;
        self.set_state(CallState::Failed { peer, reason });
        self.set_state(CallState::Idle);
    }

    async fn release(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.media.stop();
            active.connection.close().await;
        }
        self.remote_set = false;
        self.pending_candidates.clear();
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "Call state");
        self.activity.set(!matches!(state, CallState::Idle | CallState::Ended));
        self.state = state.clone();
        self.emit(CallEvent::StateChanged(state));
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            error!("Call event receiver dropped");
        }
    }

    /// The peer whose signaling is currently accepted.
    fn established_peer(&self) -> Option<&UserId> {
        match &self.state {
            CallState::RequestingMedia { peer, .. }
            | CallState::Negotiating { peer, .. }
            | CallState::Connected { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

#[async_trait]
impl FrameHandler for CallSession {
    async fn on_offer(&mut self, sender_id: UserId, offer: SessionDescription) {
        if sender_id == self.identity {
            debug!("Ignoring own offer");
            return;
        }

        match self.established_peer() {
            None if self.state.is_idle() => {
                if self.config.auto_answer {
                    if let Err(e) = self.accept_offer(sender_id, offer, Vec::new()).await {
                        warn!(error = %e, "Auto-answer failed");
                    }
                } else {
                    debug!(from = %sender_id.short(), "Offer while idle left to the notifier");
                }
            }
            Some(peer) if *peer == sender_id => {
                debug!(from = %sender_id.short(), "Repeated offer from current peer ignored");
            }
            _ => {
                info!(from = %sender_id.short(), "Busy, rejecting offer");
                self.emit(CallEvent::Rejected {
                    from: sender_id,
                    reason: RejectReason::Busy,
                });
            }
        }
    }

    async fn on_answer(&mut self, sender_id: UserId, answer: SessionDescription) {
        let awaiting = matches!(
            &self.state,
            CallState::Negotiating { role: CallRole::Caller, peer } if *peer == sender_id
        ) && !self.remote_set;
        if !awaiting {
            debug!(from = %sender_id.short(), "Answer without a pending offer ignored");
            return;
        }

        let connection = match self.connection() {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Answer arrived without a connection");
                return;
            }
        };
        if let Err(e) = connection.set_remote_description(answer).await {
            warn!(error = %e, "Remote answer rejected");
            self.fail(sender_id, CallFailure::Media(e)).await;
            return;
        }
        self.remote_set = true;
        debug!(from = %sender_id.short(), "Remote answer applied");
        self.flush_candidates(&connection).await;
    }

    async fn on_ice_candidate(&mut self, sender_id: UserId, candidate: IceCandidate) {
        if self.established_peer() != Some(&sender_id) {
            debug!(from = %sender_id.short(), "ICE candidate from outside the call ignored");
            return;
        }

        if !self.remote_set {
            self.pending_candidates.push(candidate);
            return;
        }

        match self.connection() {
            Ok(connection) => {
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    warn!(error = %e, "Failed to apply ICE candidate");
                }
            }
            Err(_) => self.pending_candidates.push(candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::StaticDevices;
    use crate::peer::LoopbackPeerFactory;
    use huddle_net::{Channel, MemoryLink, MemoryTransportFactory};

    struct Harness {
        session: CallSession,
        events: mpsc::UnboundedReceiver<CallEvent>,
        link: MemoryLink,
        devices: Arc<StaticDevices>,
        peers: LoopbackPeerFactory,
        activity: CallActivity,
        _channel: Channel,
    }

    async fn harness(me: &str) -> Harness {
        let transports = MemoryTransportFactory::new();
        let channel = Channel::open(&transports, &UserId::from(me)).await.unwrap();
        let link = transports.last_link().unwrap();
        let devices = Arc::new(StaticDevices::new(true, true));
        let peers = LoopbackPeerFactory::new();
        let activity = CallActivity::new();
        let (tx, events) = mpsc::unbounded_channel();
        let session = CallSession::new(
            UserId::from(me),
            channel.sender(),
            devices.clone(),
            Arc::new(peers.clone()),
            CallConfig::default(),
            activity.clone(),
            tx,
        );
        Harness {
            session,
            events,
            link,
            devices,
            peers,
            activity,
            _channel: channel,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 4000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_start_call_sends_offer_and_negotiates() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();

        assert_eq!(
            h.session.state(),
            &CallState::Negotiating {
                role: CallRole::Caller,
                peer: "bob".into()
            }
        );
        assert!(h.activity.is_active());
        assert!(matches!(
            h.link.sent_frames().as_slice(),
            [OutboundFrame::WebrtcOffer { target_id, .. }] if target_id.as_str() == "bob"
        ));
        assert_eq!(h.peers.last().unwrap().tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_before_devices() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();
        assert_eq!(h.devices.acquisitions(), 1);

        let err = h.session.start_call("carol".into()).await.unwrap_err();
        assert_eq!(err, CallError::CallAlreadyActive);
        assert_eq!(h.devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_media_denied_returns_to_idle_with_failure() {
        let mut h = harness("alice").await;
        h.devices.fail_with(Some(MediaError::AccessDenied));

        let err = h.session.start_call("bob".into()).await.unwrap_err();
        assert_eq!(err, CallError::Media(MediaError::AccessDenied));
        assert_eq!(h.session.state(), &CallState::Idle);
        assert!(!h.activity.is_active());
        assert!(h.link.sent_frames().is_empty());

        let failed = drain(&mut h.events).into_iter().find_map(|e| match e {
            CallEvent::StateChanged(CallState::Failed { reason, .. }) => Some(reason),
            _ => None,
        });
        assert_eq!(failed, Some(CallFailure::Media(MediaError::AccessDenied)));
    }

    #[tokio::test]
    async fn test_unanswered_offer_never_connects() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();

        h.session
            .handle_peer_event(PeerEvent::Connectivity(Connectivity::Connected))
            .await;
        assert!(matches!(h.session.state(), CallState::Negotiating { .. }));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();

        h.session.on_ice_candidate("bob".into(), candidate(1)).await;
        h.session.on_ice_candidate("mallory".into(), candidate(2)).await;
        let peer = h.peers.last().unwrap();
        assert!(peer.applied_candidates().is_empty());

        h.session
            .on_answer("bob".into(), SessionDescription::answer("v=0"))
            .await;
        assert_eq!(peer.applied_candidates(), vec![candidate(1)]);

        h.session.on_ice_candidate("bob".into(), candidate(3)).await;
        assert_eq!(peer.applied_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_stray_answer_and_own_offer_ignored() {
        let mut h = harness("alice").await;
        h.session
            .on_answer("bob".into(), SessionDescription::answer("v=0"))
            .await;
        h.session
            .on_offer("alice".into(), SessionDescription::offer("v=0"))
            .await;
        assert_eq!(h.session.state(), &CallState::Idle);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_third_party_offer_rejected_busy() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();
        drain(&mut h.events);

        h.session
            .on_offer("carol".into(), SessionDescription::offer("v=0"))
            .await;
        assert_eq!(
            drain(&mut h.events),
            vec![CallEvent::Rejected {
                from: "carol".into(),
                reason: RejectReason::Busy
            }]
        );
        assert!(matches!(h.session.state(), CallState::Negotiating { .. }));
    }

    #[tokio::test]
    async fn test_hangup_releases_everything() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();
        drain(&mut h.events);

        h.session.hangup().await;
        assert_eq!(h.session.state(), &CallState::Idle);
        assert!(!h.devices.in_use());
        assert!(h.peers.last().unwrap().is_closed());
        assert!(!h.activity.is_active());
        assert_eq!(
            drain(&mut h.events),
            vec![
                CallEvent::StateChanged(CallState::Ended),
                CallEvent::StateChanged(CallState::Idle)
            ]
        );
    }

    #[tokio::test]
    async fn test_connectivity_loss_fails_call() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();
        h.session
            .on_answer("bob".into(), SessionDescription::answer("v=0"))
            .await;
        h.session
            .handle_peer_event(PeerEvent::Connectivity(Connectivity::Connected))
            .await;
        assert!(matches!(h.session.state(), CallState::Connected { .. }));
        drain(&mut h.events);

        h.session
            .handle_peer_event(PeerEvent::Connectivity(Connectivity::Disconnected))
            .await;
        assert_eq!(h.session.state(), &CallState::Idle);
        assert!(drain(&mut h.events).contains(&CallEvent::StateChanged(CallState::Failed {
            peer: "bob".into(),
            reason: CallFailure::NegotiationLost
        })));
    }

    #[tokio::test]
    async fn test_toggles_need_a_call() {
        let mut h = harness("alice").await;
        assert_eq!(h.session.toggle_audio(), Err(CallError::NotInCall));

        h.session.start_call("bob".into()).await.unwrap();
        let sent = h.link.sent_frames().len();
        assert_eq!(h.session.toggle_audio(), Ok(false));
        assert_eq!(h.session.toggle_video(), Ok(false));
        assert_eq!(h.session.toggle_audio(), Ok(true));
        assert_eq!(h.link.sent_frames().len(), sent);
    }

    #[tokio::test]
    async fn test_local_candidate_sent_to_peer() {
        let mut h = harness("alice").await;
        h.session.start_call("bob".into()).await.unwrap();

        let event = h.session.next_peer_event().await;
        assert!(matches!(event, PeerEvent::LocalCandidate(_)));
        h.session.handle_peer_event(event).await;

        assert!(matches!(
            h.link.sent_frames().last(),
            Some(OutboundFrame::WebrtcIceCandidate { target_id, .. }) if target_id.as_str() == "bob"
        ));
    }
}
