pub mod call;
pub mod chat;
pub mod config;
pub mod context;
pub mod events;
pub mod notifier;
pub mod presence;

pub use call::{spawn_call, CallHandle};
pub use chat::{spawn_chat, ChatHandle, ChatSession, Draft, TypingIndicator};
pub use config::ClientConfig;
pub use context::{FriendSet, SessionContext};
pub use events::{emit_event, ClientEvent, EventSender};
pub use notifier::{spawn_notifier, IncomingCallRecord, NotifierHandle, NotifierState};
pub use presence::{
    spawn_presence, GeoError, Geolocator, LocationBook, PresenceHandle, ProfileCache,
    StaticGeolocator, VisibleLocation,
};

use tokio::time::Instant;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("huddle_client_lib=debug,huddle=debug,huddle_net=debug,huddle_media=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
