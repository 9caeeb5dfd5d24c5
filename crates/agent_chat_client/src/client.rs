//! WebSocket connection: frames sent before the handshake completes are
//! queued and flushed in order once open; inbound text frames fan out to
//! subscribers.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::{Connection, FrameHandler, Subscribers, Subscription};
use crate::error::ConnectionError;
use crate::stream::StreamChannel;
use crate::transport::{ChatTransport, TransportConfig};

/// Lifecycle of the underlying socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed(Option<String>),
}

/// Duplex WebSocket connection.
pub struct WsConnection {
    url: String,
    outbound: mpsc::UnboundedSender<String>,
    subscribers: Arc<Subscribers>,
    state: watch::Receiver<LinkState>,
}

impl WsConnection {
    /// Start connecting to `url` in the background and return immediately.
    /// Must be called from within a tokio runtime.
    pub fn spawn(url: &str) -> Arc<Self> {
        let (outbound, queued) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LinkState::Connecting);
        let subscribers = Subscribers::new();
        tokio::spawn(run_link(
            url.to_string(),
            queued,
            subscribers.clone(),
            state_tx,
        ));
        Arc::new(Self {
            url: url.to_string(),
            outbound,
            subscribers,
            state,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Wait until the handshake completes or fails.
    pub async fn wait_open(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow_and_update() {
                LinkState::Open => return Ok(()),
                LinkState::Closed(reason) => {
                    return Err(match reason {
                        Some(reason) => ConnectionError::Failed(reason.clone()),
                        None => ConnectionError::Closed,
                    })
                }
                LinkState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Resolves once the socket has closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        loop {
            if matches!(&*state.borrow_and_update(), LinkState::Closed(_)) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Connection for WsConnection {
    fn send(&self, text: String) -> Result<(), ConnectionError> {
        if matches!(&*self.state.borrow(), LinkState::Closed(_)) {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(text)
            .map_err(|_| ConnectionError::Closed)
    }

    fn subscribe(&self, handler: FrameHandler) -> Subscription {
        self.subscribers.add(handler)
    }
}

async fn run_link(
    url: String,
    mut queued: mpsc::UnboundedReceiver<String>,
    subscribers: Arc<Subscribers>,
    state: watch::Sender<LinkState>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!(%url, error = %e, "websocket connect failed");
            let _ = state.send(LinkState::Closed(Some(e.to_string())));
            return;
        }
    };
    info!(%url, "websocket open");
    let _ = state.send(LinkState::Open);

    let (mut write, mut read) = ws_stream.split();

    let writer = async {
        while let Some(text) = queued.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                warn!(error = %e, "websocket write failed");
                return;
            }
        }
        let _ = write.close().await;
    };

    let reader = async {
        while let Some(item) = read.next().await {
            match item {
                Ok(Message::Text(text)) => subscribers.emit(&text),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "websocket read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => debug!(%url, "writer finished"),
        _ = reader => debug!(%url, "reader finished"),
    }
    info!(%url, "websocket closed");
    let _ = state.send(LinkState::Closed(None));
}

/// Connect to the agent at `url` (e.g. `ws://localhost:8787`) and wait for
/// the handshake.
pub async fn connect(url: &str) -> Result<Arc<WsConnection>, ConnectionError> {
    let connection = WsConnection::spawn(url);
    connection.wait_open().await?;
    Ok(connection)
}

/// A transport over a freshly opened WebSocket.
pub struct ConnectedTransport {
    pub transport: ChatTransport,
    pub connection: Arc<WsConnection>,
    /// Streams the server announced without a pending resume, including the
    /// notification it may send as soon as the socket opens.
    pub unsolicited: mpsc::UnboundedReceiver<StreamChannel>,
}

/// Connect and wrap the connection in a `ChatTransport`. The transport is
/// listening before the handshake completes, so nothing the server sends on
/// open is missed.
pub async fn connect_transport(
    url: &str,
    config: TransportConfig,
) -> Result<ConnectedTransport, ConnectionError> {
    let connection = WsConnection::spawn(url);
    let transport = ChatTransport::new(connection.clone(), config);
    let unsolicited = transport.unsolicited_resumes();
    connection.wait_open().await?;
    Ok(ConnectedTransport {
        transport,
        connection,
        unsolicited,
    })
}
