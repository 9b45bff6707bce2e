//! Terminal front end for a huddle session.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use huddle_client_lib::{
    spawn_call, spawn_chat, spawn_notifier, spawn_presence, ClientConfig, ClientEvent, Draft,
    SessionContext, StaticGeolocator,
};
use huddle_media::{CallConfig, MediaConstraints, PeerConfig, StaticDevices, WebRtcPeerFactory};
use huddle_net::{HttpDirectory, WsTransportFactory};
use huddle_shared::types::{Profile, UserId};

const HELP: &str = "\
/chat <peer>      open a conversation
/call <peer>      start a call
/accept           accept the incoming call
/reject           reject the incoming call
/hangup           leave the call
/mute             toggle the microphone
/video            toggle the camera
/sticker <id>     send a sticker
/friend <peer>    add a friend
/quit             exit
anything else is sent to the open conversation";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    huddle_client_lib::init_tracing();
    info!("Starting huddle client v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    let identity = config
        .user_id
        .clone()
        .context("HUDDLE_USER_ID must be set")?;
    let username = config.display_username();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Session context
    // -----------------------------------------------------------------------
    let directory = Arc::new(HttpDirectory::new(config.api_url.clone()));
    let profile = Profile {
        username: username.clone(),
        ..Profile::default()
    };
    if let Err(e) = directory.save_profile(&identity, &profile).await {
        warn!(error = %e, "Could not publish profile");
    }

    let transports = Arc::new(WsTransportFactory::new(config.api_url.clone()));
    let ctx = SessionContext::load(identity.clone(), username, transports, directory.clone()).await;

    // -----------------------------------------------------------------------
    // 3. Components
    // -----------------------------------------------------------------------
    let (events, mut event_rx) = mpsc::unbounded_channel();

    let presence = spawn_presence(
        ctx.clone(),
        Arc::new(StaticGeolocator::new(config.position)),
        events.clone(),
    );
    let notifier = spawn_notifier(ctx.clone(), events.clone());
    let chat = spawn_chat(ctx.clone(), events.clone());

    let call_config = CallConfig {
        peer: PeerConfig {
            ice_servers: vec![config.stun_url.clone()],
        },
        constraints: MediaConstraints::default(),
        auto_answer: config.auto_answer,
    };
    let call = spawn_call(
        ctx.clone(),
        Arc::new(StaticDevices::new(true, true)),
        Arc::new(WebRtcPeerFactory::new()?),
        call_config,
        events,
    )
    .await?;

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    // -----------------------------------------------------------------------
    // 4. Command loop
    // -----------------------------------------------------------------------
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        match command {
            "" => {}
            "/quit" => break,
            "/help" => println!("{HELP}"),
            "/chat" if !arg.is_empty() => {
                if let Err(e) = chat.open(UserId::from(arg)).await {
                    warn!(error = %e, "Could not open conversation");
                }
            }
            "/call" if !arg.is_empty() => {
                notifier.call_ui_opened().await;
                if let Err(e) = call.start(UserId::from(arg)).await {
                    warn!(error = %e, "Could not start call");
                }
            }
            "/accept" => match notifier.accept().await {
                Some(record) => {
                    if let Err(e) = call.accept(record).await {
                        warn!(error = %e, "Could not accept call");
                    }
                }
                None => println!("no incoming call"),
            },
            "/reject" => notifier.reject().await,
            "/hangup" => {
                call.hangup().await;
                notifier.call_ui_closed().await;
            }
            "/mute" => match call.toggle_audio().await {
                Ok(enabled) => println!("microphone {}", if enabled { "on" } else { "off" }),
                Err(e) => warn!(error = %e, "Could not toggle microphone"),
            },
            "/video" => match call.toggle_video().await {
                Ok(enabled) => println!("camera {}", if enabled { "on" } else { "off" }),
                Err(e) => warn!(error = %e, "Could not toggle camera"),
            },
            "/sticker" if !arg.is_empty() => {
                if let Err(e) = chat.send(Draft::sticker(arg)).await {
                    warn!(error = %e, "Sticker not sent");
                }
            }
            "/friend" if !arg.is_empty() => {
                match directory.add_friend(&identity, &UserId::from(arg)).await {
                    Ok(()) => println!("friend added, restart to see their location"),
                    Err(e) => warn!(error = %e, "Could not add friend"),
                }
            }
            c if c.starts_with('/') => println!("{HELP}"),
            _ => {
                if let Err(e) = chat.send(Draft::text(line)).await {
                    warn!(error = %e, "Message not sent");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // 5. Shutdown
    // -----------------------------------------------------------------------
    call.shutdown().await;
    chat.shutdown().await;
    notifier.shutdown().await;
    presence.shutdown().await;
    info!("Bye");
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::LocationsChanged(view) => {
            for entry in view {
                info!(
                    name = %entry.profile.display_name,
                    lat = entry.location.lat,
                    lng = entry.location.lng,
                    "Location"
                );
            }
        }
        ClientEvent::ConversationChanged(conversation) => {
            if let Some(last) = conversation.messages.last() {
                info!(
                    from = %last.sender_id.short(),
                    status = ?last.status,
                    text = last.body.content().unwrap_or_default(),
                    sticker = last.body.sticker().unwrap_or_default(),
                    "Chat"
                );
            }
        }
        ClientEvent::IncomingCall(payload) => {
            println!("incoming call from {} (/accept or /reject)", payload.display_name);
        }
        ClientEvent::CallStateChanged(payload) => match &payload.message {
            Some(message) => println!("call {}: {message}", payload.state),
            None => println!("call {}", payload.state),
        },
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = other.name(), %json, "Event"),
            Err(e) => warn!(event = other.name(), error = %e, "Unprintable event"),
        },
    }
}
