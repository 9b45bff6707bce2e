//! In-process transport used by tests and local tooling.
//!
//! Every `connect` creates a [`MemoryLink`]: the test side of the
//! connection. It records what the client sent, injects inbound frames and
//! can drop the connection from the "server" side. [`MemoryDirectory`] is
//! the matching stand-in for the REST directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use huddle_shared::constants::CHANNEL_BUFFER;
use huddle_shared::error::{ChannelError, DirectoryError};
use huddle_shared::message::{ChatMessage, MessageStatus};
use huddle_shared::protocol::OutboundFrame;
use huddle_shared::types::{MessageId, Profile, UserId};

use crate::directory::Directory;
use crate::transport::{Transport, TransportEvent, TransportFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct LinkInner {
    identity: UserId,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    inbound: mpsc::Sender<TransportEvent>,
    sent_notify: Notify,
}

impl LinkInner {
    fn shut(&self, reason: Option<String>) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.try_send(TransportEvent::Closed { reason });
        }
    }
}

struct MemoryTransport {
    inner: Arc<LinkInner>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        lock(&self.inner.sent).push(text);
        self.inner.sent_notify.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }
}

/// Test-side handle of one in-memory connection.
#[derive(Clone)]
pub struct MemoryLink {
    inner: Arc<LinkInner>,
}

impl MemoryLink {
    pub fn identity(&self) -> &UserId {
        &self.inner.identity
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Deliver raw text as if the server had sent it.
    pub fn push_frame(&self, text: impl Into<String>) {
        if !self.is_open() {
            debug!("Dropping frame pushed to a closed link");
            return;
        }
        let _ = self.inbound_send(TransportEvent::Frame(text.into()));
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push_frame(value.to_string());
    }

    /// Close the connection from the server side.
    pub fn drop_connection(&self) {
        self.inner.shut(None);
    }

    /// Everything the client sent, as raw text.
    pub fn sent_text(&self) -> Vec<String> {
        lock(&self.inner.sent).clone()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent_text()
            .iter()
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }

    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.sent_text()
            .iter()
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }

    /// Drain the sent log.
    pub fn take_sent_frames(&self) -> Vec<OutboundFrame> {
        let drained: Vec<String> = lock(&self.inner.sent).drain(..).collect();
        drained
            .iter()
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }

    /// Wait until at least `count` frames have been sent in total.
    pub async fn wait_sent(&self, count: usize) -> Vec<OutboundFrame> {
        loop {
            let notified = self.inner.sent_notify.notified();
            let sent = lock(&self.inner.sent).len();
            if sent >= count {
                return self.sent_frames();
            }
            notified.await;
        }
    }

    fn inbound_send(&self, event: TransportEvent) -> Result<(), ChannelError> {
        self.inner
            .inbound
            .try_send(event)
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

#[derive(Default)]
struct FactoryState {
    refuse: bool,
    links: Vec<MemoryLink>,
}

/// Hands out [`MemoryLink`]-backed transports.
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    state: Arc<Mutex<FactoryState>>,
    link_notify: Arc<Notify>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    pub fn links(&self) -> Vec<MemoryLink> {
        lock(&self.state).links.clone()
    }

    pub fn last_link(&self) -> Option<MemoryLink> {
        lock(&self.state).links.last().cloned()
    }

    /// Wait for the `index`-th connection (zero based) to be made.
    pub async fn wait_link(&self, index: usize) -> MemoryLink {
        loop {
            let notified = self.link_notify.notified();
            let found = lock(&self.state).links.get(index).cloned();
            if let Some(link) = found {
                return link;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(
        &self,
        identity: &UserId,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), ChannelError> {
        let mut state = lock(&self.state);
        if state.refuse {
            return Err(ChannelError::Connect("connection refused".into()));
        }

        let (inbound, events) = mpsc::channel(CHANNEL_BUFFER);
        let inner = Arc::new(LinkInner {
            identity: identity.clone(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            inbound,
            sent_notify: Notify::new(),
        });
        state.links.push(MemoryLink {
            inner: inner.clone(),
        });
        drop(state);
        self.link_notify.notify_waiters();

        Ok((Arc::new(MemoryTransport { inner }), events))
    }
}

#[derive(Default)]
struct DirectoryState {
    profiles: HashMap<UserId, Profile>,
    friends: HashMap<UserId, Vec<UserId>>,
    history: Vec<ChatMessage>,
    status_updates: Vec<(Vec<MessageId>, MessageStatus)>,
    profile_lookups: usize,
    fail_friends: bool,
}

/// In-process [`Directory`] with scripted content.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_profile(&self, user: impl Into<UserId>, profile: Profile) {
        lock(&self.state).profiles.insert(user.into(), profile);
    }

    pub fn put_friends(&self, user: impl Into<UserId>, friends: &[&str]) {
        lock(&self.state)
            .friends
            .insert(user.into(), friends.iter().map(|f| UserId::from(*f)).collect());
    }

    pub fn push_history(&self, message: ChatMessage) {
        lock(&self.state).history.push(message);
    }

    /// Make `friends` fail with an HTTP error.
    pub fn fail_friends(&self, fail: bool) {
        lock(&self.state).fail_friends = fail;
    }

    pub fn status_updates(&self) -> Vec<(Vec<MessageId>, MessageStatus)> {
        lock(&self.state).status_updates.clone()
    }

    pub fn profile_lookups(&self) -> usize {
        lock(&self.state).profile_lookups
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn profile(&self, user: &UserId) -> Result<Profile, DirectoryError> {
        let mut state = lock(&self.state);
        state.profile_lookups += 1;
        state
            .profiles
            .get(user)
            .cloned()
            .ok_or_else(|| DirectoryError::ProfileLookupFailed(user.to_string()))
    }

    async fn friends(&self, user: &UserId) -> Result<Vec<UserId>, DirectoryError> {
        let state = lock(&self.state);
        if state.fail_friends {
            return Err(DirectoryError::Http("friends unavailable".into()));
        }
        Ok(state.friends.get(user).cloned().unwrap_or_default())
    }

    async fn history(
        &self,
        user: &UserId,
        peer: &UserId,
    ) -> Result<Vec<ChatMessage>, DirectoryError> {
        Ok(lock(&self.state)
            .history
            .iter()
            .filter(|m| m.is_between(user, peer))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        message_ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<(), DirectoryError> {
        let mut state = lock(&self.state);
        state.status_updates.push((message_ids.to_vec(), status));
        for message in state.history.iter_mut() {
            if message.id.is_some_and(|id| message_ids.contains(&id)) {
                let _ = message.advance_status(status);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_records_and_closes() {
        let factory = MemoryTransportFactory::new();
        let (transport, mut events) = factory.connect(&UserId::from("u1")).await.unwrap();
        let link = factory.last_link().unwrap();
        assert_eq!(link.identity().as_str(), "u1");

        transport.send_text("{\"type\":\"typing_start\",\"receiver_id\":\"u2\"}".into())
            .await
            .unwrap();
        assert_eq!(link.sent_text().len(), 1);
        assert_eq!(link.sent_frames().len(), 1);

        link.push_frame("hello");
        assert_eq!(events.recv().await, Some(TransportEvent::Frame("hello".into())));

        link.drop_connection();
        assert_eq!(events.recv().await, Some(TransportEvent::Closed { reason: None }));
        assert_eq!(
            transport.send_text("late".into()).await,
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_wait_link_sees_later_connect() {
        let factory = MemoryTransportFactory::new();
        let waiter = {
            let factory = factory.clone();
            tokio::spawn(async move { factory.wait_link(0).await })
        };
        let _conn = factory.connect(&UserId::from("u1")).await.unwrap();
        let link = waiter.await.unwrap();
        assert_eq!(link.identity().as_str(), "u1");
    }
}
