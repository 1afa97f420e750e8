//! Transport seam between the session controller and the remote service.
//!
//! A connector yields a split transport: an outbound sink written by the session's
//! writer task and an inbound stream read by the dispatch loop. How bytes reach
//! the service (WebSocket, gRPC, a test harness) is the connector's business.
//!
//! [`MemoryConnector`] is an in-process transport whose far side is a
//! [`RemoteEnd`]; tests and demos use it to play the remote service. Every message
//! crossing it is serialized to JSON and parsed back, so the wire codec is
//! exercised exactly as a network transport would.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{ClientMessage, ServerMessage, SetupMessage};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound half of a live transport.
#[async_trait]
pub trait OutboundSink: Send {
    async fn send(&mut self, message: ClientMessage) -> VoiceResult<()>;

    /// Close the outbound half. Further sends fail.
    async fn close(&mut self) -> VoiceResult<()>;
}

/// Inbound half of a live transport.
#[async_trait]
pub trait InboundStream: Send {
    /// Next message, an error, or `None` once the remote closed the stream.
    ///
    /// Driven by a single reader task and never dropped mid-call, so it need not
    /// be cancel safe.
    async fn next(&mut self) -> Option<VoiceResult<ServerMessage>>;
}

/// A connected, split transport.
pub struct Transport {
    pub sink: Box<dyn OutboundSink>,
    pub stream: Box<dyn InboundStream>,
}

/// Opens transports to the remote service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> VoiceResult<Transport>;
}

enum RemoteFrame {
    Message(String),
    Error(String),
}

/// In-process connector paired with a [`RemoteEnd`]. Connects once.
pub struct MemoryConnector {
    pending: Mutex<Option<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<RemoteFrame>)>>,
    refusal: Option<String>,
}

impl MemoryConnector {
    pub fn new() -> (Self, RemoteEnd) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let connector = Self {
            pending: Mutex::new(Some((client_tx, server_rx))),
            refusal: None,
        };
        let remote = RemoteEnd { client_rx, server_tx };
        (connector, remote)
    }

    /// A connector whose every connect attempt fails.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            pending: Mutex::new(None),
            refusal: Some(reason.into()),
        }
    }
}

#[async_trait]
impl LiveConnector for MemoryConnector {
    async fn connect(&self) -> VoiceResult<Transport> {
        if let Some(reason) = &self.refusal {
            return Err(VoiceError::Connection(reason.clone()));
        }
        let (client_tx, server_rx) = self
            .pending
            .lock()
            .map_err(|_| VoiceError::Connection("memory connector poisoned".to_string()))?
            .take()
            .ok_or_else(|| VoiceError::Connection("memory transport already connected".to_string()))?;

        debug!("Memory transport connected");
        Ok(Transport {
            sink: Box::new(MemorySink { tx: Some(client_tx) }),
            stream: Box::new(MemoryStream { rx: server_rx }),
        })
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl OutboundSink for MemorySink {
    async fn send(&mut self, message: ClientMessage) -> VoiceResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| VoiceError::Transport("sink closed".to_string()))?;
        tx.send(message.to_json()?)
            .map_err(|_| VoiceError::Transport("remote end dropped".to_string()))
    }

    async fn close(&mut self) -> VoiceResult<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<RemoteFrame>,
}

#[async_trait]
impl InboundStream for MemoryStream {
    async fn next(&mut self) -> Option<VoiceResult<ServerMessage>> {
        match self.rx.recv().await? {
            RemoteFrame::Message(text) => Some(ServerMessage::from_json(&text)),
            RemoteFrame::Error(reason) => Some(Err(VoiceError::Transport(reason))),
        }
    }
}

/// The service side of a [`MemoryConnector`].
pub struct RemoteEnd {
    client_rx: mpsc::UnboundedReceiver<String>,
    server_tx: mpsc::UnboundedSender<RemoteFrame>,
}

impl RemoteEnd {
    /// Next message from the client; `None` once the client closed its sink.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        let text = self.client_rx.recv().await?;
        ClientMessage::from_json(&text).ok()
    }

    /// Like [`recv`](Self::recv) but gives up after `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<ClientMessage> {
        tokio::time::timeout(wait, self.recv()).await.ok().flatten()
    }

    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        let text = self.client_rx.try_recv().ok()?;
        ClientMessage::from_json(&text).ok()
    }

    /// Wait for the client's setup and answer with `setupComplete`.
    pub async fn accept(&mut self) -> Option<SetupMessage> {
        loop {
            if let ClientMessage::Setup(setup) = self.recv().await? {
                self.send(ServerMessage::setup_complete());
                return Some(setup);
            }
        }
    }

    /// Push a message to the client. Returns false if the client is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    /// Push raw text, valid or not.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.server_tx.send(RemoteFrame::Message(text.into())).is_ok()
    }

    /// Surface a transport error on the client's stream.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.server_tx.send(RemoteFrame::Error(reason.into())).is_ok()
    }

    /// Close the server-to-client direction.
    pub fn close(self) {
        drop(self);
    }
}
