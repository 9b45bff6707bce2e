//! WebSocket relay.
//!
//! Every connected socket is registered in the [`Hub`] under its identity.
//! One identity may hold several sockets (one per client component); each of
//! them receives every frame addressed to that identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_shared::protocol::{InboundFrame, OutboundFrame};
use huddle_shared::types::{Location, UserId};

use crate::config::ServerConfig;
use crate::store::Store;

type SocketId = u64;

/// Registry of live sockets.
pub struct Hub {
    sockets: Mutex<HashMap<UserId, Vec<(SocketId, mpsc::Sender<String>)>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Vec<(SocketId, mpsc::Sender<String>)>>> {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, user: &UserId) -> (SocketId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().entry(user.clone()).or_default().push((id, tx));
        (id, rx)
    }

    pub fn unregister(&self, user: &UserId, socket: SocketId) {
        let mut sockets = self.lock();
        if let Some(list) = sockets.get_mut(user) {
            list.retain(|(id, _)| *id != socket);
            if list.is_empty() {
                sockets.remove(user);
            }
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.lock().contains_key(user)
    }

    pub fn online_count(&self) -> usize {
        self.lock().len()
    }

    /// Queue `frame` on every socket of `user`.
    pub fn send_to(&self, user: &UserId, frame: &InboundFrame) {
        let Some(text) = encode(frame) else { return };
        if let Some(list) = self.lock().get(user) {
            for (id, tx) in list {
                if let Err(e) = tx.try_send(text.clone()) {
                    warn!(user = %user.short(), socket = id, error = %e, "Dropping frame");
                }
            }
        }
    }

    /// Queue `frame` on every socket.
    pub fn broadcast(&self, frame: &InboundFrame) {
        let Some(text) = encode(frame) else { return };
        for (user, list) in self.lock().iter() {
            for (id, tx) in list {
                if let Err(e) = tx.try_send(text.clone()) {
                    warn!(user = %user.short(), socket = id, error = %e, "Dropping frame");
                }
            }
        }
    }
}

fn encode(frame: &InboundFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(kind = frame.kind(), error = %e, "Could not encode frame");
            None
        }
    }
}

/// Route one client frame from `sender`.
pub fn handle_frame(
    hub: &Hub,
    store: &Store,
    config: &ServerConfig,
    sender: &UserId,
    frame: OutboundFrame,
) {
    match frame {
        OutboundFrame::LocationUpdate {
            lat,
            lng,
            accuracy,
            username,
        } => {
            let location = Location {
                user_id: sender.clone(),
                username: Some(username).filter(|n| !n.is_empty()),
                lat,
                lng,
                accuracy,
                timestamp: Utc::now(),
            };
            store.upsert_location(location.clone());
            hub.broadcast(&InboundFrame::LocationUpdate {
                user_id: sender.clone(),
                location,
            });
        }

        OutboundFrame::Message { receiver_id, body } => {
            let len = body.content().or(body.sticker()).map_or(0, str::len);
            if body.is_blank() || len > config.max_message_len {
                warn!(sender = %sender.short(), len, "Rejecting message body");
                return;
            }
            let delivered = hub.is_online(&receiver_id);
            let message = store.append_message(sender.clone(), receiver_id.clone(), body, delivered);
            debug!(
                id = ?message.id,
                sender = %sender.short(),
                receiver = %receiver_id.short(),
                delivered,
                "Message stored"
            );

            let frame = InboundFrame::Message(message);
            hub.send_to(sender, &frame);
            if receiver_id != *sender {
                hub.send_to(&receiver_id, &frame);
            }
        }

        OutboundFrame::TypingStart { receiver_id } => hub.send_to(
            &receiver_id,
            &InboundFrame::TypingStatus {
                sender_id: sender.clone(),
                is_typing: true,
            },
        ),

        OutboundFrame::TypingStop { receiver_id } => hub.send_to(
            &receiver_id,
            &InboundFrame::TypingStatus {
                sender_id: sender.clone(),
                is_typing: false,
            },
        ),

        OutboundFrame::WebrtcOffer { target_id, offer } => hub.send_to(
            &target_id,
            &InboundFrame::WebrtcOffer {
                sender_id: sender.clone(),
                offer,
            },
        ),

        OutboundFrame::WebrtcAnswer { target_id, answer } => hub.send_to(
            &target_id,
            &InboundFrame::WebrtcAnswer {
                sender_id: sender.clone(),
                answer,
            },
        ),

        OutboundFrame::WebrtcIceCandidate {
            target_id,
            candidate,
        } => hub.send_to(
            &target_id,
            &InboundFrame::WebrtcIceCandidate {
                sender_id: sender.clone(),
                candidate,
            },
        ),
    }
}

/// Drive one accepted socket until it closes.
pub async fn serve_socket(
    socket: WebSocket,
    user: UserId,
    hub: Arc<Hub>,
    store: Arc<Store>,
    config: Arc<ServerConfig>,
) {
    let (socket_id, mut outbound) = hub.register(&user);
    info!(user = %user.short(), socket = socket_id, "Socket connected");

    hub.send_to(
        &user,
        &InboundFrame::InitialLocations {
            locations: store.locations(),
        },
    );

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            next = stream.next() => {
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(user = %user.short(), error = %e, "Socket read error");
                        break;
                    }
                };
                match serde_json::from_str::<OutboundFrame>(text.as_str()) {
                    Ok(frame) => handle_frame(&hub, &store, &config, &user, frame),
                    Err(e) => warn!(user = %user.short(), error = %e, "Malformed client frame"),
                }
            }
            _ = &mut writer => break,
        }
    }

    writer.abort();
    hub.unregister(&user, socket_id);
    info!(user = %user.short(), socket = socket_id, "Socket disconnected");
}
