// Types and wire protocol shared by the client, media and server crates.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::HuddleError;
pub use message::{ChatMessage, MessageBody, MessageStatus};
pub use protocol::{IceCandidate, InboundFrame, OutboundFrame, SessionDescription};
pub use types::{DisplayProfile, Location, MessageId, Position, Profile, UserId};
