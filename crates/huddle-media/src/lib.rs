//! Media side of a call: device and peer-connection seams, the webrtc-rs
//! adapter and the signaling state machine that ties them to the channel.

pub mod devices;
pub mod peer;
pub mod signaling;
pub mod webrtc_peer;

pub use devices::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, StaticDevices, TrackKind};
pub use peer::{
    Connectivity, LoopbackPeer, LoopbackPeerFactory, PeerConfig, PeerConnection,
    PeerConnectionFactory, PeerEvent,
};
pub use signaling::{
    CallActivity, CallConfig, CallEvent, CallFailure, CallRole, CallSession, CallState,
    RejectReason,
};
pub use webrtc_peer::{WebRtcPeerConnection, WebRtcPeerFactory};
