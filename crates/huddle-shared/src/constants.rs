use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Huddle";

/// Default base URL of the API / relay server
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default HTTP port of the relay server
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Default STUN server handed to peer connections
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// How often the presence publisher re-samples and publishes the position
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Idle time after the last keystroke before `typing_stop` is sent
pub const TYPING_IDLE: Duration = Duration::from_secs(1);

/// How long an undecided incoming call survives after the call UI closes
pub const NOTIFICATION_GRACE: Duration = Duration::from_secs(1);

/// Max distance between an optimistic message and its server echo
pub const RECONCILE_WINDOW: Duration = Duration::from_secs(30);

/// Buffer size of per-channel event queues
pub const CHANNEL_BUFFER: usize = 256;

/// Maximum chat message length accepted by the relay, in bytes
pub const MAX_MESSAGE_LEN: usize = 4096;
