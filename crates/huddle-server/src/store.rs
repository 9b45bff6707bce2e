//! In-memory state: profiles, friend lists, last locations and messages.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;

use huddle_shared::message::{ChatMessage, MessageBody, MessageStatus};
use huddle_shared::types::{Location, MessageId, Profile, UserId};

#[derive(Default)]
struct Inner {
    profiles: HashMap<UserId, Profile>,
    friends: HashMap<UserId, BTreeSet<UserId>>,
    locations: HashMap<UserId, Location>,
    messages: Vec<ChatMessage>,
    next_id: i64,
}

#[derive(Default)]
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn profile(&self, user: &UserId) -> Option<Profile> {
        self.lock().profiles.get(user).cloned()
    }

    pub fn save_profile(&self, user: UserId, profile: Profile) {
        self.lock().profiles.insert(user, profile);
    }

    pub fn friends(&self, user: &UserId) -> Vec<UserId> {
        self.lock()
            .friends
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `false` if `friend` was already listed.
    pub fn add_friend(&self, user: UserId, friend: UserId) -> bool {
        self.lock().friends.entry(user).or_default().insert(friend)
    }

    pub fn upsert_location(&self, location: Location) {
        self.lock()
            .locations
            .insert(location.user_id.clone(), location);
    }

    pub fn locations(&self) -> Vec<Location> {
        let mut locations: Vec<Location> = self.lock().locations.values().cloned().collect();
        locations.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        locations
    }

    /// Store a new message with the next id.
    pub fn append_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        body: MessageBody,
        delivered: bool,
    ) -> ChatMessage {
        let mut inner = self.lock();
        inner.next_id += 1;

        let now = Utc::now();
        let message = ChatMessage {
            id: Some(MessageId(inner.next_id)),
            sender_id,
            receiver_id,
            body,
            status: if delivered {
                MessageStatus::Delivered
            } else {
                MessageStatus::Sent
            },
            timestamp: now,
            delivered_at: delivered.then_some(now),
            read_at: None,
        };
        inner.messages.push(message.clone());
        message
    }

    /// Conversation between `a` and `b` in storage order.
    pub fn history(&self, a: &UserId, b: &UserId) -> Vec<ChatMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect()
    }

    /// Move the listed messages forward to `status`. Returns the messages
    /// that actually changed; regressions are ignored.
    pub fn update_status(&self, ids: &[MessageId], status: MessageStatus) -> Vec<ChatMessage> {
        let mut inner = self.lock();
        let mut changed = Vec::new();
        for message in inner.messages.iter_mut() {
            let Some(id) = message.id.filter(|id| ids.contains(id)) else {
                continue;
            };
            match message.advance_status(status) {
                Ok(true) => changed.push(message.clone()),
                Ok(false) => {}
                Err(e) => debug!(id = id.0, error = %e, "Status update ignored"),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> MessageBody {
        MessageBody::Text(s.into())
    }

    #[test]
    fn test_ids_increase_and_history_filters() {
        let store = Store::new();
        let a = store.append_message("a".into(), "b".into(), text("1"), false);
        store.append_message("c".into(), "a".into(), text("2"), false);
        let b = store.append_message("b".into(), "a".into(), text("3"), true);

        assert_eq!(a.id, Some(MessageId(1)));
        assert_eq!(b.status, MessageStatus::Delivered);
        assert!(b.delivered_at.is_some());

        let history = store.history(&"a".into(), &"b".into());
        assert_eq!(history, vec![a, b]);
    }

    #[test]
    fn test_update_status_reports_changes_only() {
        let store = Store::new();
        store.append_message("a".into(), "b".into(), text("1"), false);
        store.append_message("a".into(), "b".into(), text("2"), true);

        let changed = store.update_status(&[MessageId(1), MessageId(2)], MessageStatus::Delivered);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, Some(MessageId(1)));

        store.update_status(&[MessageId(1)], MessageStatus::Read);
        let changed = store.update_status(&[MessageId(1)], MessageStatus::Sent);
        assert!(changed.is_empty());
        assert_eq!(
            store.history(&"a".into(), &"b".into())[0].status,
            MessageStatus::Read
        );
    }

    #[test]
    fn test_friends_are_deduplicated() {
        let store = Store::new();
        assert!(store.add_friend("a".into(), "b".into()));
        assert!(!store.add_friend("a".into(), "b".into()));
        store.add_friend("a".into(), "c".into());
        assert_eq!(store.friends(&"a".into()), vec![UserId::from("b"), UserId::from("c")]);
        assert!(store.friends(&"z".into()).is_empty());
    }
}
