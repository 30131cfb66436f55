//! Transport boundary: one text frame out, one text frame or a close in.
//!
//! The controller sees the socket as a [`Connection`]: an unbounded outbound
//! queue and an inbound event stream. The queue has exactly one consumer, a
//! writer task that owns the WebSocket sink, so frames from every path
//! (heartbeat acks, refresh, subscribe) go out whole and in enqueue order.
//!
//! ```text
//!  controller ──send()──▶ [outbound queue] ──▶ write pump ──▶ ws sink
//!  controller ◀──recv()── [inbound events] ◀── read pump  ◀── ws stream
//! ```

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use dlink_core::prelude::*;

/// Capacity of the inbound event channel.
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete inbound text frame.
    Frame(String),
    /// The connection ended. Always the last event.
    Closed(String),
}

/// An open connection, owned by the session controller.
///
/// Dropping it closes the outbound queue; the writer then sends a Close
/// frame and exits.
#[derive(Debug)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<TransportEvent>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Enqueue one text frame.
    ///
    /// # Errors
    ///
    /// [`Error::Send`] if the writer side is gone.
    pub fn send(&self, frame: String) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| Error::send("connection is not open"))
    }

    /// Wait for the next inbound event. `None` means every producer is gone,
    /// which callers treat like a close.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

/// Opens connections.
#[trait_variant::make(Connector: Send)]
pub trait LocalConnector {
    /// Open a connection to `url`.
    ///
    /// # Errors
    ///
    /// [`Error::Connect`] for DNS, TCP, TLS or handshake failures.
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// [`Connector`] over `tokio-tungstenite` (ws:// and wss://).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::connect(format!("invalid url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::connect(format!(
                "unsupported scheme {} in {url}",
                parsed.scheme()
            )));
        }

        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| Error::connect(format!("failed to connect to {url}: {e}")))?;
        debug!("WebSocket connected to {}", url);

        let (sink, stream) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        tokio::spawn(write_pump(sink, out_rx, in_tx.clone()));
        tokio::spawn(read_pump(stream, in_tx));

        Ok(Connection::new(out_tx, in_rx))
    }
}

impl<T: Connector + Sync> Connector for std::sync::Arc<T> {
    async fn connect(&self, url: &str) -> Result<Connection> {
        self.as_ref().connect(url).await
    }
}

// ---------------------------------------------------------------------------
// Pump tasks
// ---------------------------------------------------------------------------

/// Drain the outbound queue into the socket.
async fn write_pump(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
            warn!("WebSocket write failed: {}", e);
            let _ = events
                .send(TransportEvent::Closed(format!("write failed: {e}")))
                .await;
            return;
        }
    }

    // Queue closed: the connection was dropped by its owner.
    if let Err(e) = sink.send(WsMessage::Close(None)).await {
        debug!("Failed to send Close frame: {}", e);
    }
    let _ = sink.close().await;
    debug!("WebSocket writer exiting");
}

/// Forward inbound text frames until the socket ends.
async fn read_pump(mut stream: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if events
                    .send(TransportEvent::Frame(text.to_string()))
                    .await
                    .is_err()
                {
                    // Nobody is listening any more.
                    return;
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                debug!("Ignoring {} byte binary frame", bytes.len());
            }
            Some(Ok(_)) => {
                // Ping/Pong are answered by tungstenite.
            }
            Some(Err(e)) => break format!("read failed: {e}"),
            None => break "eof".to_string(),
        }
    };

    debug!("WebSocket reader exiting: {}", reason);
    let _ = events.send(TransportEvent::Closed(reason)).await;
}
