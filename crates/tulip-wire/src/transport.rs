//! Framed duplex transports.
//!
//! A [`Transport`] is a read half and a write half exchanging [`Frame`]s.
//! Inbound talks arrive as axum WebSockets, outbound ones are
//! tokio-tungstenite clients; both are adapted to the same pair of traits so
//! the talk never sees the difference. An in-memory pair backs the tests.

use crate::error::WireError;
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Liveness probe; carries no payload.
    Ping,
    Pong,
    Close,
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the connection is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, WireError>>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WireError>;

    async fn close(&mut self) -> Result<(), WireError>;
}

/// A connected peer transport.
pub struct Transport {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
    /// Human-readable description of the remote end.
    pub peer: String,
}

impl Transport {
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            source,
            sink,
            peer: peer.into(),
        }
    }

    /// Wrap a tokio-tungstenite client stream.
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        Self::new(
            Box::new(TungsteniteSource { inner: source }),
            Box::new(TungsteniteSink { inner: sink }),
            peer,
        )
    }

    /// Wrap an upgraded axum WebSocket.
    pub fn from_axum(ws: WebSocket, peer: impl Into<String>) -> Self {
        let (sink, source) = ws.split();
        Self::new(
            Box::new(AxumSource { inner: source }),
            Box::new(AxumSink { inner: sink }),
            peer,
        )
    }

    /// Two transports wired back to back, for tests.
    pub fn memory_pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let a = Self::new(
            Box::new(MemorySource { rx: b_rx }),
            Box::new(MemorySink { tx: Some(a_tx) }),
            "memory:a",
        );
        let b = Self::new(
            Box::new(MemorySource { rx: a_rx }),
            Box::new(MemorySink { tx: Some(b_tx) }),
            "memory:b",
        );
        (a, b)
    }
}

// ---------------------------------------------------------------------------
// tokio-tungstenite
// ---------------------------------------------------------------------------

fn from_ws_message(msg: WsMessage) -> Frame {
    match msg {
        WsMessage::Text(text) => Frame::Text(text),
        WsMessage::Binary(data) => Frame::Binary(data),
        WsMessage::Ping(_) => Frame::Ping,
        WsMessage::Pong(_) => Frame::Pong,
        WsMessage::Close(_) => Frame::Close,
        WsMessage::Frame(frame) => Frame::Binary(frame.into_data()),
    }
}

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Ping => WsMessage::Ping(Vec::new()),
        Frame::Pong => WsMessage::Pong(Vec::new()),
        Frame::Close => WsMessage::Close(None),
    }
}

struct TungsteniteSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, WireError>> {
        let msg = self.inner.next().await?;
        Some(msg.map(from_ws_message).map_err(WireError::from))
    }
}

struct TungsteniteSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WireError> {
        self.inner.send(to_ws_message(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), WireError> {
        self.inner.close().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// axum
// ---------------------------------------------------------------------------

fn from_axum_message(msg: AxumMessage) -> Frame {
    match msg {
        AxumMessage::Text(text) => Frame::Text(text.as_str().to_string()),
        AxumMessage::Binary(data) => Frame::Binary(data.to_vec()),
        AxumMessage::Ping(_) => Frame::Ping,
        AxumMessage::Pong(_) => Frame::Pong,
        AxumMessage::Close(_) => Frame::Close,
    }
}

fn to_axum_message(frame: Frame) -> AxumMessage {
    match frame {
        Frame::Text(text) => AxumMessage::Text(text.into()),
        Frame::Binary(data) => AxumMessage::Binary(data.into()),
        Frame::Ping => AxumMessage::Ping(Default::default()),
        Frame::Pong => AxumMessage::Pong(Default::default()),
        Frame::Close => AxumMessage::Close(None),
    }
}

struct AxumSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, WireError>> {
        let msg = self.inner.next().await?;
        Some(
            msg.map(from_axum_message)
                .map_err(|e| WireError::Transport(e.to_string())),
        )
    }
}

struct AxumSink {
    inner: SplitSink<WebSocket, AxumMessage>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WireError> {
        self.inner
            .send(to_axum_message(frame))
            .await
            .map_err(|e| WireError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), WireError> {
        self.inner
            .close()
            .await
            .map_err(|e| WireError::Transport(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

struct MemorySource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, WireError>> {
        self.rx.recv().await.map(Ok)
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WireError> {
        let tx = self.tx.as_ref().ok_or(WireError::ConnectionClosed)?;
        tx.send(frame).await.map_err(|_| WireError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), WireError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Frame::Close).await;
        }
        Ok(())
    }
}
