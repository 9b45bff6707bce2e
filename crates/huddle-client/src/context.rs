//! Session-wide state shared by every component.
//!
//! The [`SessionContext`] is built once per login and handed to each
//! component constructor. Nothing in it is mutated after construction
//! except the [`CallActivity`] flag, which only the call controller writes.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use huddle_media::CallActivity;
use huddle_net::{Channel, Directory, TransportFactory};
use huddle_shared::types::UserId;

/// Identities whose locations may be rendered. Always contains self.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendSet(Arc<HashSet<UserId>>);

impl FriendSet {
    /// Build from the directory's list plus self.
    pub fn new(me: &UserId, friends: impl IntoIterator<Item = UserId>) -> Self {
        let mut set: HashSet<UserId> = friends.into_iter().collect();
        set.insert(me.clone());
        Self(Arc::new(set))
    }

    /// Load from the directory; on failure only self is visible.
    pub async fn load(directory: &dyn Directory, me: &UserId) -> Self {
        match directory.friends(me).await {
            Ok(friends) => {
                info!(count = friends.len(), "Friend list loaded");
                Self::new(me, friends)
            }
            Err(e) => {
                warn!(error = %e, "Could not load friend list, showing only self");
                Self::new(me, [])
            }
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.0.contains(user)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub identity: UserId,
    pub username: String,
    pub friends: FriendSet,
    pub call_activity: CallActivity,
    pub transports: Arc<dyn TransportFactory>,
    pub directory: Arc<dyn Directory>,
}

impl SessionContext {
    pub async fn load(
        identity: UserId,
        username: String,
        transports: Arc<dyn TransportFactory>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        let friends = FriendSet::load(directory.as_ref(), &identity).await;
        Self {
            identity,
            username,
            friends,
            call_activity: CallActivity::new(),
            transports,
            directory,
        }
    }

    /// Open a fresh channel for `component`, logging instead of failing.
    pub async fn open_channel(&self, component: &'static str) -> Option<Channel> {
        match Channel::open(self.transports.as_ref(), &self.identity).await {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!(component, error = %e, "Channel unavailable");
                None
            }
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .field("friends", &self.friends.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_net::MemoryDirectory;

    #[tokio::test]
    async fn test_friend_set_always_contains_self() {
        let directory = MemoryDirectory::new();
        directory.put_friends("me", &["a", "b"]);

        let friends = FriendSet::load(&directory, &UserId::from("me")).await;
        assert!(friends.contains(&UserId::from("me")));
        assert!(friends.contains(&UserId::from("a")));
        assert_eq!(friends.len(), 3);
    }

    #[tokio::test]
    async fn test_friend_set_falls_back_to_self() {
        let directory = MemoryDirectory::new();
        directory.put_friends("me", &["a"]);
        directory.fail_friends(true);

        let friends = FriendSet::load(&directory, &UserId::from("me")).await;
        assert_eq!(friends, FriendSet::new(&UserId::from("me"), []));
    }
}
