use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use huddle_media::{
    CallActivity, CallConfig, CallEvent, CallFailure, CallRole, CallSession, CallState,
    Connectivity, LoopbackPeerFactory, PeerEvent, StaticDevices,
};
use huddle_net::{dispatch, Channel, MemoryLink, MemoryTransportFactory};
use huddle_shared::error::MediaError;
use huddle_shared::protocol::{InboundFrame, OutboundFrame};
use huddle_shared::types::UserId;

struct Party {
    id: UserId,
    session: CallSession,
    events: mpsc::UnboundedReceiver<CallEvent>,
    link: MemoryLink,
    devices: Arc<StaticDevices>,
    peers: LoopbackPeerFactory,
    _channel: Channel,
}

async fn party(name: &str, auto_answer: bool) -> Party {
    let id = UserId::from(name);
    let transports = MemoryTransportFactory::new();
    let channel = Channel::open(&transports, &id).await.unwrap();
    let link = transports.last_link().unwrap();
    let devices = Arc::new(StaticDevices::new(true, true));
    let peers = LoopbackPeerFactory::new();
    let (tx, events) = mpsc::unbounded_channel();

    let session = CallSession::new(
        id.clone(),
        channel.sender(),
        devices.clone(),
        Arc::new(peers.clone()),
        CallConfig {
            auto_answer,
            ..CallConfig::default()
        },
        CallActivity::new(),
        tx,
    );

    Party {
        id,
        session,
        events,
        link,
        devices,
        peers,
        _channel: channel,
    }
}

/// Deliver everything `from` has sent to `to`, rewritten the way the relay
/// rewrites addressed frames.
async fn relay(from: &Party, to: &mut Party) {
    for frame in from.link.take_sent_frames() {
        let inbound = match frame {
            OutboundFrame::WebrtcOffer { target_id, offer } if target_id == to.id => {
                InboundFrame::WebrtcOffer {
                    sender_id: from.id.clone(),
                    offer,
                }
            }
            OutboundFrame::WebrtcAnswer { target_id, answer } if target_id == to.id => {
                InboundFrame::WebrtcAnswer {
                    sender_id: from.id.clone(),
                    answer,
                }
            }
            OutboundFrame::WebrtcIceCandidate {
                target_id,
                candidate,
            } if target_id == to.id => InboundFrame::WebrtcIceCandidate {
                sender_id: from.id.clone(),
                candidate,
            },
            _ => continue,
        };
        dispatch(inbound, &mut to.session).await;
    }
}

/// Handle every peer event that is already queued.
async fn pump(party: &mut Party) {
    loop {
        let next =
            tokio::time::timeout(Duration::from_millis(20), party.session.next_peer_event()).await;
        match next {
            Ok(event) => party.session.handle_peer_event(event).await,
            Err(_) => break,
        }
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_two_sessions_reach_connected() {
    let mut alice = party("alice", false).await;
    let mut bob = party("bob", true).await;

    alice.session.start_call(bob.id.clone()).await.unwrap();
    relay(&alice, &mut bob).await;
    assert_eq!(
        bob.session.state(),
        &CallState::Negotiating {
            role: CallRole::Callee,
            peer: alice.id.clone()
        }
    );

    pump(&mut alice).await;
    pump(&mut bob).await;
    relay(&bob, &mut alice).await;
    relay(&alice, &mut bob).await;

    let alice_peer = alice.peers.last().unwrap();
    let bob_peer = bob.peers.last().unwrap();
    assert_eq!(alice_peer.applied_candidates().len(), 1);
    assert_eq!(bob_peer.applied_candidates().len(), 1);
    assert!(alice_peer.remote_description().is_some());

    alice_peer.emit(PeerEvent::Connectivity(Connectivity::Connected));
    bob_peer.emit(PeerEvent::Connectivity(Connectivity::Connected));
    pump(&mut alice).await;
    pump(&mut bob).await;

    assert_eq!(
        alice.session.state(),
        &CallState::Connected {
            role: CallRole::Caller,
            peer: bob.id.clone()
        }
    );
    assert_eq!(
        bob.session.state(),
        &CallState::Connected {
            role: CallRole::Callee,
            peer: alice.id.clone()
        }
    );
}

#[tokio::test]
async fn test_callee_media_denied_leaves_caller_negotiating() {
    let mut alice = party("alice", false).await;
    let mut bob = party("bob", true).await;
    bob.devices.fail_with(Some(MediaError::AccessDenied));

    alice.session.start_call(bob.id.clone()).await.unwrap();
    relay(&alice, &mut bob).await;

    assert_eq!(bob.session.state(), &CallState::Idle);
    assert!(bob.link.sent_frames().is_empty());
    let failure = drain(&mut bob.events).into_iter().find_map(|e| match e {
        CallEvent::StateChanged(CallState::Failed { reason, .. }) => Some(reason),
        _ => None,
    });
    assert_eq!(failure, Some(CallFailure::Media(MediaError::AccessDenied)));
    assert_ne!(
        CallFailure::Media(MediaError::AccessDenied).user_message(),
        CallFailure::Media(MediaError::DeviceBusy).user_message()
    );

    relay(&bob, &mut alice).await;
    assert_eq!(
        alice.session.state(),
        &CallState::Negotiating {
            role: CallRole::Caller,
            peer: bob.id.clone()
        }
    );
}

#[tokio::test]
async fn test_accept_with_early_candidates() {
    let mut alice = party("alice", false).await;
    let mut bob = party("bob", false).await;

    alice.session.start_call(bob.id.clone()).await.unwrap();
    pump(&mut alice).await;

    let sent = alice.link.take_sent_frames();
    let offer = sent
        .iter()
        .find_map(|f| match f {
            OutboundFrame::WebrtcOffer { offer, .. } => Some(offer.clone()),
            _ => None,
        })
        .unwrap();
    let early: Vec<_> = sent
        .into_iter()
        .filter_map(|f| match f {
            OutboundFrame::WebrtcIceCandidate { candidate, .. } => Some(candidate),
            _ => None,
        })
        .collect();
    assert_eq!(early.len(), 1);

    bob.session
        .accept_offer(alice.id.clone(), offer, early.clone())
        .await
        .unwrap();

    let bob_peer = bob.peers.last().unwrap();
    assert_eq!(bob_peer.applied_candidates(), early);
    assert!(matches!(
        bob.link.sent_frames().first(),
        Some(OutboundFrame::WebrtcAnswer { target_id, .. }) if *target_id == alice.id
    ));
}

#[tokio::test]
async fn test_answer_from_stranger_is_ignored() {
    let mut alice = party("alice", false).await;
    let mut bob = party("bob", true).await;
    let mallory = UserId::from("mallory");

    alice.session.start_call(bob.id.clone()).await.unwrap();
    relay(&alice, &mut bob).await;

    // Replay bob's answer under a different sender.
    for frame in bob.link.take_sent_frames() {
        if let OutboundFrame::WebrtcAnswer { answer, .. } = frame {
            dispatch(
                InboundFrame::WebrtcAnswer {
                    sender_id: mallory.clone(),
                    answer,
                },
                &mut alice.session,
            )
            .await;
        }
    }
    assert!(alice.peers.last().unwrap().remote_description().is_none());

    alice.peers.last().unwrap().emit(PeerEvent::Connectivity(Connectivity::Connected));
    pump(&mut alice).await;
    assert!(matches!(alice.session.state(), CallState::Negotiating { .. }));
}
