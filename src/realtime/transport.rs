//! Message transport under a realtime session.
//!
//! A [`Connector`] opens a connection and returns a [`TransportHandle`]: an
//! ordered outbound queue and a stream of inbound events. The websocket
//! implementation runs one writer task (which also sends keep-alive pings)
//! and one reader task per connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::realtime::error::{RealtimeError, Result};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Close code for a normal client-initiated shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame, or a binary frame that decoded as UTF-8.
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Failed(String),
}

/// The client side of an open connection. Dropping `outbound` closes it.
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens connections for a realtime session.
///
/// The returned future resolves once, with either an open transport or the
/// reason it could not be opened.
pub trait Connector: Send + Sync {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<TransportHandle>>;
}

/// Websocket connector over rustls.
#[derive(Debug, Clone)]
pub struct WsConnector {
    keepalive: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(KEEPALIVE_INTERVAL)
    }
}

impl WsConnector {
    pub fn new(keepalive: Duration) -> Self {
        Self { keepalive }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<TransportHandle>> {
        let keepalive = self.keepalive;
        Box::pin(async move {
            // The query carries the API key; only log the host.
            let host = url.host_str().unwrap_or_default().to_string();
            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| RealtimeError::Connection(e.to_string()))?;
            info!("websocket connected to {host}");

            let (sink, source) = stream.split();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            tokio::spawn(write_loop(sink, out_rx, keepalive));
            tokio::spawn(read_loop(source, in_tx));

            Ok(TransportHandle {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    keepalive: Duration,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        warn!("websocket send failed: {e}");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("websocket close failed: {e}");
                    }
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    warn!("websocket ping failed: {e}");
                    break;
                }
            }
        }
    }
    debug!("websocket writer finished");
}

async fn read_loop<S, E>(mut source: S, inbound: mpsc::UnboundedSender<Inbound>)
where
    S: futures_util::Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let end = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if inbound.send(Inbound::Text(text.to_string())).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => {
                    if inbound.send(Inbound::Text(text)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("binary message is not text: {e}"),
            },
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => Inbound::Closed {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.to_string(),
                    },
                    None => Inbound::Closed {
                        code: None,
                        reason: String::new(),
                    },
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Inbound::Failed(e.to_string()),
            None => {
                break Inbound::Closed {
                    code: None,
                    reason: String::new(),
                }
            }
        }
    };
    let _ = inbound.send(end);
    debug!("websocket reader finished");
}

/// The far end of a [`LoopbackConnector`] connection.
pub struct LoopbackPeer {
    pub url: Url,
    /// Messages the client queued, in order.
    pub received: mpsc::UnboundedReceiver<Outbound>,
    sender: mpsc::UnboundedSender<Inbound>,
}

impl LoopbackPeer {
    /// Deliver a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.sender.send(Inbound::Text(text.into())).is_ok()
    }

    pub fn complete_setup(&self) -> bool {
        self.send_text(r#"{"setupComplete":{}}"#)
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.sender
            .send(Inbound::Closed {
                code: Some(code),
                reason: reason.into(),
            })
            .is_ok()
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.sender.send(Inbound::Failed(reason.into())).is_ok()
    }

    /// Next message from the client parsed as JSON. `None` once the client
    /// closed or `wait` ran out.
    pub async fn next_json(&mut self, wait: Duration) -> Option<serde_json::Value> {
        match tokio::time::timeout(wait, self.received.recv()).await {
            Ok(Some(Outbound::Text(text))) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    /// Drain what the client has queued so far.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = self.received.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// In-process connector. Each successful connect hands a [`LoopbackPeer`]
/// to the receiver returned by [`LoopbackConnector::pair`].
pub struct LoopbackConnector {
    peers: mpsc::UnboundedSender<LoopbackPeer>,
    attempts: AtomicUsize,
    refuse: AtomicBool,
}

impl LoopbackConnector {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: tx,
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        });
        (connector, rx)
    }

    /// Make later connects fail as if the server were unreachable.
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<TransportHandle>> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let result = if self.refuse.load(Ordering::Acquire) {
            Err(RealtimeError::Connection("connection refused".into()))
        } else {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let peer = LoopbackPeer {
                url,
                received: out_rx,
                sender: in_tx,
            };
            match self.peers.send(peer) {
                Ok(()) => Ok(TransportHandle {
                    outbound: out_tx,
                    inbound: in_rx,
                }),
                Err(_) => Err(RealtimeError::Connection("no loopback listener".into())),
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn reader_decodes_binary_frames_and_reports_close() {
        let frames: [std::result::Result<Message, String>; 4] = [
            Ok(Message::text("one")),
            Ok(Message::Binary(b"two".to_vec().into())),
            Ok(Message::Binary(vec![0xFF, 0xFE].into())),
            Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))),
        ];
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(stream::iter(frames), tx).await;

        assert_eq!(rx.recv().await, Some(Inbound::Text("one".into())));
        assert_eq!(rx.recv().await, Some(Inbound::Text("two".into())));
        assert_eq!(
            rx.recv().await,
            Some(Inbound::Closed {
                code: Some(1000),
                reason: "bye".into()
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn reader_reports_errors_and_end_of_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frames: [std::result::Result<Message, String>; 1] = [Err("reset".into())];
        read_loop(stream::iter(frames), tx).await;
        assert_eq!(rx.recv().await, Some(Inbound::Failed("reset".into())));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let frames: Vec<std::result::Result<Message, String>> = Vec::new();
        read_loop(stream::iter(frames), tx).await;
        assert!(matches!(rx.recv().await, Some(Inbound::Closed { code: None, .. })));
    }

    #[tokio::test]
    async fn loopback_hands_out_a_peer_per_connect() {
        let (connector, mut peers) = LoopbackConnector::pair();
        let url = Url::parse("wss://example.test/live?key=k").unwrap();

        let mut handle = connector.connect(url.clone()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.url, url);

        handle.outbound.send(Outbound::Text("{\"a\":1}".into())).unwrap();
        let json = peer.next_json(Duration::from_secs(1)).await.unwrap();
        assert_eq!(json["a"], 1);

        assert!(peer.complete_setup());
        assert_eq!(
            handle.inbound.recv().await,
            Some(Inbound::Text(r#"{"setupComplete":{}}"#.into()))
        );

        connector.set_refusing(true);
        assert!(connector.connect(url).await.is_err());
        assert_eq!(connector.attempts(), 2);
    }
}
