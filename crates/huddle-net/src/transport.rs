//! Text-frame transport to the relay.
//!
//! A [`Transport`] is the send half of one full-duplex connection; the
//! receive half is an mpsc stream of [`TransportEvent`]s fed by a read pump
//! task. [`WsTransportFactory`] dials the per-identity WebSocket endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use huddle_shared::constants::CHANNEL_BUFFER;
use huddle_shared::error::ChannelError;
use huddle_shared::types::UserId;

use crate::endpoint;

/// Something that happened on the receive side of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Frame(String),
    /// The connection is gone; no more frames will follow.
    Closed { reason: Option<String> },
}

/// Send half of an open connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send_text(&self, text: String) -> Result<(), ChannelError>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Opens transports for an identity.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        identity: &UserId,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), ChannelError>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// WebSocket transport (tokio-tungstenite).
pub struct WsTransport {
    sink: Mutex<Option<WsSink>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::NotConnected)?;

        trace!(len = text.len(), "--> ws frame");
        if let Err(e) = sink.send(Message::text(text)).await {
            self.open.store(false, Ordering::SeqCst);
            return Err(ChannelError::Send(e.to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "WebSocket close handshake failed");
            }
        }
    }
}

/// Dials `{api}/ws/{identity}`.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    api_url: String,
}

impl WsTransportFactory {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(
        &self,
        identity: &UserId,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), ChannelError> {
        let url = endpoint::ws_url(&self.api_url, identity)?;
        info!(url = %url, "Dialing channel endpoint");

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        let open = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_BUFFER);

        tokio::spawn(read_pump(stream, event_tx, open.clone()));

        let transport = Arc::new(WsTransport {
            sink: Mutex::new(Some(sink)),
            open,
        });

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>, open: Arc<AtomicBool>) {
    let mut reason = None;

    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => {
                trace!(len = text.len(), "<-- ws frame");
                if event_tx
                    .send(TransportEvent::Frame(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    debug!("Channel receiver dropped, stopping read pump");
                    break;
                }
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    if event_tx
                        .send(TransportEvent::Frame(text.to_owned()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => warn!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                reason = frame.map(|f| f.reason.as_str().to_owned());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                reason = Some(e.to_string());
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = event_tx.send(TransportEvent::Closed { reason }).await;
}
