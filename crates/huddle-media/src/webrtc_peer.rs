//! [`PeerConnection`] backed by webrtc-rs.
//!
//! Local tracks are `TrackLocalStaticSample`s: the connection negotiates
//! Opus / VP8 and keeps the senders alive, feeding them is the capture
//! pipeline's job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use huddle_shared::constants::CHANNEL_BUFFER;
use huddle_shared::error::MediaError;
use huddle_shared::protocol::{IceCandidate, SdpKind, SessionDescription};

use crate::devices::{LocalMedia, TrackKind};
use crate::peer::{Connectivity, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent};

const STREAM_ID: &str = "huddle";

fn negotiation(e: webrtc::Error) -> MediaError {
    MediaError::Negotiation(e.to_string())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(MediaError::Negotiation(format!(
            "unsupported description type {other:?}"
        ))),
    }
}

fn connectivity(state: RTCPeerConnectionState) -> Connectivity {
    match state {
        RTCPeerConnectionState::Connecting => Connectivity::Connecting,
        RTCPeerConnectionState::Connected => Connectivity::Connected,
        RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
        RTCPeerConnectionState::Failed => Connectivity::Failed,
        RTCPeerConnectionState::Closed => Connectivity::Closed,
        _ => Connectivity::New,
    }
}

pub struct WebRtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeerConnection {
    fn wire_callbacks(pc: &RTCPeerConnection, events: mpsc::Sender<PeerEvent>) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "Could not serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(?state, "Peer connection state");
                let _ = tx.send(PeerEvent::Connectivity(connectivity(state))).await;
            })
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    let id = track.id();
                    debug!(%kind, %id, "Remote track");
                    let _ = tx.send(PeerEvent::RemoteTrack { kind, id }).await;
                })
            },
        ));
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.inner.create_offer(None).await.map_err(negotiation)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.inner.create_answer(None).await.map_err(negotiation)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.inner
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.inner
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.inner
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(negotiation)
    }

    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), MediaError> {
        let mut senders = self.senders.lock().await;
        for track in media.tracks() {
            let mime_type = match track.kind {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                STREAM_ID.to_owned(),
            ));
            self.inner
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(negotiation)?;
            senders.push(local);
        }
        debug!(tracks = senders.len(), "Local tracks attached");
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            warn!(error = %e, "Peer connection close failed");
        }
    }
}

/// Builds webrtc-rs peer connections with the default codecs and
/// interceptors.
pub struct WebRtcPeerFactory {
    api: API,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(negotiation)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError> {
        let mut rtc_config = RTCConfiguration::default();
        if !config.ice_servers.is_empty() {
            rtc_config.ice_servers = vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let inner = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(negotiation)?,
        );

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        WebRtcPeerConnection::wire_callbacks(&inner, tx);
        debug!(servers = ?config.ice_servers, "Peer connection created");

        let connection = WebRtcPeerConnection {
            inner,
            senders: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(connection), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_mapping() {
        assert_eq!(
            connectivity(RTCPeerConnectionState::Connected),
            Connectivity::Connected
        );
        assert_eq!(
            connectivity(RTCPeerConnectionState::Disconnected),
            Connectivity::Disconnected
        );
        assert_eq!(connectivity(RTCPeerConnectionState::New), Connectivity::New);
    }

    #[tokio::test]
    async fn test_offer_has_audio_and_video_sections() {
        let factory = WebRtcPeerFactory::new().unwrap();
        let (pc, _events) = factory
            .create(&PeerConfig {
                ice_servers: Vec::new(),
            })
            .await
            .unwrap();

        let media = LocalMedia::new(vec![
            crate::devices::LocalTrack::new("a1", TrackKind::Audio),
            crate::devices::LocalTrack::new("v1", TrackKind::Video),
        ]);
        pc.add_local_tracks(&media).await.unwrap();

        let offer = pc.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        pc.close().await;
    }
}
