//! Peer-connection seam.
//!
//! A [`PeerConnection`] does description exchange and ICE; everything it
//! notices on its own (gathered candidates, connectivity changes, remote
//! tracks) arrives on the [`PeerEvent`] receiver returned next to it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use huddle_shared::constants::{CHANNEL_BUFFER, DEFAULT_STUN_URL};
use huddle_shared::error::MediaError;
use huddle_shared::protocol::{IceCandidate, SdpKind, SessionDescription};

use crate::devices::{LocalMedia, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
    RemoteTrack { kind: TrackKind, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Attach every track of `media` for sending.
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), MediaError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError>;
}

// ---------------------------------------------------------------------------
// Loopback implementation
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    tracks: Vec<TrackKind>,
    closed: bool,
}

/// In-process peer connection. It produces placeholder SDP, emits one local
/// candidate when its local description is set and otherwise only reports
/// what the owner injects through [`LoopbackPeer::emit`].
#[derive(Clone)]
pub struct LoopbackPeer {
    index: usize,
    state: Arc<Mutex<LoopbackState>>,
    events: mpsc::Sender<PeerEvent>,
}

impl LoopbackPeer {
    /// Inject an event as if the connection had produced it.
    pub fn emit(&self, event: PeerEvent) {
        if self.events.try_send(event).is_err() {
            debug!(index = self.index, "Loopback peer event dropped");
        }
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied_candidates.clone()
    }

    pub fn tracks(&self) -> Vec<TrackKind> {
        lock(&self.state).tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\n",
            self.index
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if lock(&self.state).remote.is_none() {
            return Err(MediaError::Negotiation("answer without remote offer".into()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\n",
            self.index
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        lock(&self.state).local = Some(desc);
        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.index,
                50000 + self.index
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        let expected = match state.local {
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            }) => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        if desc.kind != expected {
            return Err(MediaError::Negotiation(format!(
                "unexpected {:?} description",
                desc.kind
            )));
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(MediaError::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), MediaError> {
        lock(&self.state)
            .tracks
            .extend(media.tracks().iter().map(|t| t.kind));
        Ok(())
    }

    async fn close(&self) {
        lock(&self.state).closed = true;
    }
}

/// Creates [`LoopbackPeer`]s and keeps a handle to each.
#[derive(Clone, Default)]
pub struct LoopbackPeerFactory {
    created: Arc<Mutex<Vec<LoopbackPeer>>>,
    counter: Arc<AtomicUsize>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> Vec<LoopbackPeer> {
        lock(&self.created).clone()
    }

    pub fn last(&self) -> Option<LoopbackPeer> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        _config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError> {
        let (events, rx) = mpsc::channel(CHANNEL_BUFFER);
        let peer = LoopbackPeer {
            index: self.counter.fetch_add(1, Ordering::SeqCst),
            state: Arc::new(Mutex::new(LoopbackState::default())),
            events,
        };
        lock(&self.created).push(peer.clone());
        Ok((Arc::new(peer), rx))
    }
}
