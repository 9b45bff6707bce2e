//! Presence publisher.
//!
//! Samples the device position on a fixed cadence and publishes it as a
//! `location_update`, while maintaining the friend-filtered view of everyone
//! else's last known location.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_net::{dispatch, recv_from, Channel, ChannelEvent, Directory, FrameHandler};
use huddle_shared::constants::PUBLISH_INTERVAL;
use huddle_shared::protocol::OutboundFrame;
use huddle_shared::types::{DisplayProfile, Location, Position, UserId};

use crate::context::{FriendSet, SessionContext};
use crate::events::{emit_event, ClientEvent, EventSender};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    Unavailable,
    #[error("position request timed out")]
    Timeout,
}

/// One-shot position source, polled by the publisher.
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self) -> Result<Position, GeoError>;
}

/// Geolocator that reports a configured value.
pub struct StaticGeolocator {
    position: Mutex<Result<Position, GeoError>>,
    samples: AtomicUsize,
}

impl StaticGeolocator {
    pub fn new(position: Option<Position>) -> Self {
        Self {
            position: Mutex::new(position.ok_or(GeoError::Unavailable)),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, position: Result<Position, GeoError>) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = position;
    }

    /// How many times the position was requested.
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geolocator for StaticGeolocator {
    async fn current_position(&self) -> Result<Position, GeoError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        self.position
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Last known location per identity. Entries are never expired.
#[derive(Debug, Default)]
pub struct LocationBook {
    entries: HashMap<UserId, Location>,
}

impl LocationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `user_id`.
    pub fn apply_update(&mut self, user_id: UserId, mut location: Location) {
        location.user_id = user_id.clone();
        self.entries.insert(user_id, location);
    }

    /// Bulk upsert of a snapshot.
    pub fn apply_initial(&mut self, locations: Vec<Location>) {
        for location in locations {
            self.entries.insert(location.user_id.clone(), location);
        }
    }

    /// Locations of friends only, ordered by identity.
    pub fn visible(&self, friends: &FriendSet) -> Vec<&Location> {
        let mut visible: Vec<&Location> = self
            .entries
            .values()
            .filter(|l| friends.contains(&l.user_id))
            .collect();
        visible.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        visible
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Display metadata per identity, cached for the life of the mount.
#[derive(Debug, Default)]
pub struct ProfileCache {
    entries: HashMap<UserId, DisplayProfile>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &UserId) -> Option<&DisplayProfile> {
        self.entries.get(user)
    }

    /// Resolve the profile for the owner of `location`, hitting the directory
    /// only on the first request.
    pub async fn resolve(&mut self, directory: &dyn Directory, location: &Location) -> DisplayProfile {
        if let Some(profile) = self.entries.get(&location.user_id) {
            return profile.clone();
        }

        let fallback = location
            .username
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| location.user_id.to_string());

        let profile = match directory.profile(&location.user_id).await {
            Ok(profile) => DisplayProfile::from_profile(profile, &fallback),
            Err(e) => {
                debug!(user = %location.user_id.short(), error = %e, "Profile lookup failed, using fallback");
                DisplayProfile {
                    display_name: fallback,
                    avatar: None,
                }
            }
        };
        self.entries.insert(location.user_id.clone(), profile.clone());
        profile
    }
}

/// A rendered marker.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VisibleLocation {
    pub location: Location,
    pub profile: DisplayProfile,
}

/// Presence state reduced from inbound frames.
pub struct PresenceState {
    ctx: SessionContext,
    book: LocationBook,
    profiles: ProfileCache,
    view: Vec<VisibleLocation>,
    events: EventSender,
}

impl PresenceState {
    pub fn new(ctx: SessionContext, events: EventSender) -> Self {
        Self {
            ctx,
            book: LocationBook::new(),
            profiles: ProfileCache::new(),
            view: Vec::new(),
            events,
        }
    }

    pub fn view(&self) -> &[VisibleLocation] {
        &self.view
    }

    async fn refresh(&mut self) {
        let visible: Vec<Location> = self
            .book
            .visible(&self.ctx.friends)
            .into_iter()
            .cloned()
            .collect();

        let mut view = Vec::with_capacity(visible.len());
        for location in visible {
            let profile = self
                .profiles
                .resolve(self.ctx.directory.as_ref(), &location)
                .await;
            view.push(VisibleLocation { location, profile });
        }

        self.view = view;
        emit_event(&self.events, ClientEvent::LocationsChanged(self.view.clone()));
    }
}

#[async_trait]
impl FrameHandler for PresenceState {
    async fn on_location_update(&mut self, user_id: UserId, location: Location) {
        self.book.apply_update(user_id, location);
        self.refresh().await;
    }

    async fn on_initial_locations(&mut self, locations: Vec<Location>) {
        debug!(count = locations.len(), "Initial locations received");
        self.book.apply_initial(locations);
        self.refresh().await;
    }
}

enum PresenceCommand {
    Snapshot {
        reply: oneshot::Sender<Vec<VisibleLocation>>,
    },
    Shutdown,
}

/// Handle to a running presence publisher. Dropping it stops the task.
pub struct PresenceHandle {
    commands: mpsc::Sender<PresenceCommand>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    /// Currently rendered locations.
    pub async fn snapshot(&self) -> Vec<VisibleLocation> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(PresenceCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop publishing, close the channel and drop the view.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(PresenceCommand::Shutdown).await;
        let _ = (&mut self.task).await;
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Mount the presence publisher.
pub fn spawn_presence(
    ctx: SessionContext,
    geolocator: std::sync::Arc<dyn Geolocator>,
    events: EventSender,
) -> PresenceHandle {
    let (commands, mut command_rx) = mpsc::channel(16);

    let task = tokio::spawn(async move {
        let username = ctx.username.clone();
        let first = sample(geolocator.as_ref()).await;
        let mut channel = ctx.open_channel("presence").await;
        if let (Some(position), Some(ch)) = (first, channel.as_ref()) {
            publish(ch, position, &username).await;
        }

        let mut state = PresenceState::new(ctx, events);
        let start = tokio::time::Instant::now() + PUBLISH_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, PUBLISH_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(position) = sample(geolocator.as_ref()).await else {
                        continue;
                    };
                    match channel.as_ref() {
                        Some(ch) => publish(ch, position, &username).await,
                        None => debug!("No channel, skipping location publish"),
                    }
                }

                event = recv_from(&mut channel) => {
                    match event {
                        ChannelEvent::Frame(frame) => dispatch(frame, &mut state).await,
                        ChannelEvent::Closed { reason } => {
                            warn!(?reason, "Presence channel closed");
                            channel = None;
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(PresenceCommand::Snapshot { reply }) => {
                            let _ = reply.send(state.view().to_vec());
                        }
                        Some(PresenceCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        if let Some(ch) = channel.take() {
            ch.close().await;
        }
        info!("Presence publisher stopped");
    });

    PresenceHandle { commands, task }
}

async fn sample(geolocator: &dyn Geolocator) -> Option<Position> {
    match geolocator.current_position().await {
        Ok(position) => Some(position),
        Err(e) => {
            warn!(error = %e, "Could not read position");
            None
        }
    }
}

async fn publish(channel: &Channel, position: Position, username: &str) {
    let frame = OutboundFrame::LocationUpdate {
        lat: position.lat,
        lng: position.lng,
        accuracy: position.accuracy,
        username: username.to_string(),
    };
    if let Err(e) = channel.send(&frame).await {
        warn!(error = %e, "Location publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use huddle_media::CallActivity;
    use huddle_net::{MemoryDirectory, MemoryTransportFactory};
    use huddle_shared::types::Profile;

    fn location(user: &str, username: Option<&str>) -> Location {
        Location {
            user_id: UserId::from(user),
            username: username.map(str::to_string),
            lat: 1.0,
            lng: 2.0,
            accuracy: None,
            timestamp: Utc::now(),
        }
    }

    fn context(
        transports: &MemoryTransportFactory,
        directory: &MemoryDirectory,
        friends: &[&str],
    ) -> SessionContext {
        let me = UserId::from("me");
        SessionContext {
            friends: FriendSet::new(&me, friends.iter().map(|f| UserId::from(*f))),
            identity: me,
            username: "Me".into(),
            call_activity: CallActivity::new(),
            transports: Arc::new(transports.clone()),
            directory: Arc::new(directory.clone()),
        }
    }

    fn ids(visible: &[&Location]) -> Vec<String> {
        visible.iter().map(|l| l.user_id.to_string()).collect()
    }

    #[test]
    fn test_visible_is_friend_filtered_in_any_order() {
        let friends = FriendSet::new(&UserId::from("me"), [UserId::from("a")]);

        let mut first = LocationBook::new();
        first.apply_initial(vec![location("a", None), location("stranger", None)]);
        first.apply_update(UserId::from("me"), location("me", None));

        let mut second = LocationBook::new();
        second.apply_update(UserId::from("stranger"), location("stranger", None));
        second.apply_update(UserId::from("me"), location("me", None));
        second.apply_initial(vec![location("a", None)]);

        assert_eq!(ids(&first.visible(&friends)), vec!["a", "me"]);
        assert_eq!(ids(&second.visible(&friends)), vec!["a", "me"]);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_update_replaces_single_entry() {
        let friends = FriendSet::new(&UserId::from("me"), [UserId::from("a")]);
        let mut book = LocationBook::new();
        book.apply_update(UserId::from("a"), location("a", None));
        let mut moved = location("a", None);
        moved.lat = 50.0;
        book.apply_update(UserId::from("a"), moved);

        let visible = book.visible(&friends);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].lat, 50.0);
    }

    #[tokio::test]
    async fn test_profile_cache_fallbacks_are_cached() {
        let directory = MemoryDirectory::new();
        directory.put_profile(
            "a",
            Profile {
                username: "Alice".into(),
                avatar: Some("a.png".into()),
                bio: None,
            },
        );
        let mut cache = ProfileCache::new();

        let alice = cache.resolve(&directory, &location("a", Some("al"))).await;
        assert_eq!(alice.display_name, "Alice");
        assert_eq!(alice.avatar.as_deref(), Some("a.png"));

        let named = cache.resolve(&directory, &location("b", Some("bee"))).await;
        assert_eq!(named.display_name, "bee");

        let raw = cache.resolve(&directory, &location("c", None)).await;
        assert_eq!(raw, DisplayProfile::raw(&UserId::from("c")));

        let lookups = directory.profile_lookups();
        cache.resolve(&directory, &location("b", Some("bee"))).await;
        cache.resolve(&directory, &location("a", None)).await;
        assert_eq!(directory.profile_lookups(), lookups);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_on_activation_and_every_interval() {
        let transports = MemoryTransportFactory::new();
        let directory = MemoryDirectory::new();
        let geolocator = Arc::new(StaticGeolocator::new(Some(Position {
            lat: 10.0,
            lng: 20.0,
            accuracy: Some(5.0),
        })));
        let (events, _event_rx) = mpsc::unbounded_channel();

        let handle = spawn_presence(context(&transports, &directory, &[]), geolocator.clone(), events);
        let link = transports.wait_link(0).await;

        let sent = link.wait_sent(1).await;
        assert!(matches!(
            &sent[0],
            OutboundFrame::LocationUpdate { lat, username, .. } if *lat == 10.0 && username == "Me"
        ));

        tokio::time::sleep(PUBLISH_INTERVAL * 2 + Duration::from_millis(10)).await;
        assert_eq!(link.wait_sent(3).await.len(), 3);
        assert_eq!(geolocator.samples(), 3);

        handle.shutdown().await;
        assert!(!link.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_still_opens_channel() {
        let transports = MemoryTransportFactory::new();
        let directory = MemoryDirectory::new();
        let geolocator = Arc::new(StaticGeolocator::new(None));
        let (events, _event_rx) = mpsc::unbounded_channel();

        let handle = spawn_presence(context(&transports, &directory, &[]), geolocator.clone(), events);
        let link = transports.wait_link(0).await;

        tokio::time::sleep(PUBLISH_INTERVAL + Duration::from_millis(10)).await;
        assert!(link.sent_frames().is_empty());
        assert!(link.is_open());

        geolocator.set(Ok(Position {
            lat: 1.0,
            lng: 1.0,
            accuracy: None,
        }));
        tokio::time::sleep(PUBLISH_INTERVAL).await;
        assert_eq!(link.wait_sent(1).await.len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_locations_render_friends_only() {
        let transports = MemoryTransportFactory::new();
        let directory = MemoryDirectory::new();
        let geolocator = Arc::new(StaticGeolocator::new(None));
        let (events, mut event_rx) = mpsc::unbounded_channel();

        let handle = spawn_presence(context(&transports, &directory, &["a"]), geolocator, events);
        let link = transports.wait_link(0).await;

        link.push_json(serde_json::json!({
            "type": "initial_locations",
            "locations": [
                {"user_id": "a", "username": "al", "lat": 1.0, "lng": 2.0, "timestamp": "2024-05-01T10:00:00Z"},
                {"user_id": "stranger", "lat": 3.0, "lng": 4.0, "timestamp": "2024-05-01T10:00:00Z"}
            ]
        }));

        let Some(ClientEvent::LocationsChanged(view)) = event_rx.recv().await else {
            panic!("expected a locations event");
        };
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].profile.display_name, "al");
        assert_eq!(handle.snapshot().await, view);

        handle.shutdown().await;
    }
}
