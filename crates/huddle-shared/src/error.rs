use thiserror::Error;

#[derive(Error, Debug)]
pub enum HuddleError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Malformed message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Failures of the per-identity real-time channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// A send was attempted while the channel was not open.
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Failed to connect channel: {0}")]
    Connect(String),

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// An inbound frame that could not be turned into a typed message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Frame has no type field")]
    MissingType,

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} frame: {reason}")]
    InvalidFields { kind: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Camera or microphone access was denied")]
    AccessDenied,

    #[error("Camera or microphone is busy")]
    DeviceBusy,

    #[error("No camera or microphone found")]
    DeviceMissing,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),
}

impl MediaError {
    /// Text shown to the user; each cause gets its own wording.
    pub fn user_message(&self) -> &'static str {
        match self {
            MediaError::AccessDenied => {
                "Camera/microphone permission denied. Allow access and try again."
            }
            MediaError::DeviceBusy => {
                "Camera/microphone is in use by another application."
            }
            MediaError::DeviceMissing => "No camera or microphone was found on this device.",
            MediaError::Negotiation(_) => "Could not set up the call connection.",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("No recipient selected")]
    NoRecipientSelected,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is already in progress; devices are not touched.
    #[error("A call is already active")]
    CallAlreadyActive,

    #[error("Not in a call")]
    NotInCall,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {status} from {path}")]
    Status { status: u16, path: String },

    #[error("Profile lookup failed for {0}")]
    ProfileLookupFailed(String),
}
