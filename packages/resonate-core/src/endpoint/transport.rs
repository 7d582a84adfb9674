//! Transport seam between the endpoint state machine and a WebSocket.
//!
//! The endpoint only speaks [`WireFrame`]s through the [`FrameSink`] /
//! [`FrameSource`] pair. Adapters are provided for the axum accept path,
//! the tokio-tungstenite connect path, and an in-memory pair for tests.
//! Raw sockets never leak past this module.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(String),

    #[error("connection closed")]
    Closed,
}

/// One frame on the wire, as the endpoint sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
    Ping,
    Pong,
    /// Peer-initiated close.
    Close,
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Sends a close frame and flushes. Errors are ignored; the socket is
    /// going away either way.
    async fn close(&mut self);
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame. `None` means the stream ended.
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>>;
}

pub type BoxFrameSink = Box<dyn FrameSink>;
pub type BoxFrameSource = Box<dyn FrameSource>;

// ─────────────────────────────────────────────────────────────────────────────
// axum adapter (server accept path)
// ─────────────────────────────────────────────────────────────────────────────

struct AxumSink(SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>);
struct AxumSource(SplitStream<axum::extract::ws::WebSocket>);

/// Wraps an accepted axum WebSocket.
pub fn from_axum(socket: axum::extract::ws::WebSocket) -> (BoxFrameSink, BoxFrameSource) {
    let (sink, stream) = socket.split();
    (Box::new(AxumSink(sink)), Box::new(AxumSource(stream)))
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        use axum::extract::ws::Message;
        let msg = match frame {
            WireFrame::Text(text) => Message::Text(text.into()),
            WireFrame::Binary(data) => Message::Binary(data),
            WireFrame::Ping => Message::Ping(Bytes::new()),
            WireFrame::Pong => Message::Pong(Bytes::new()),
            WireFrame::Close => Message::Close(None),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>> {
        use axum::extract::ws::Message;
        let item = self.0.next().await?;
        Some(match item {
            Ok(Message::Text(text)) => Ok(WireFrame::Text(text.to_string())),
            Ok(Message::Binary(data)) => Ok(WireFrame::Binary(data)),
            Ok(Message::Ping(_)) => Ok(WireFrame::Ping),
            Ok(Message::Pong(_)) => Ok(WireFrame::Pong),
            Ok(Message::Close(_)) => Ok(WireFrame::Close),
            Err(e) => Err(TransportError::Ws(e.to_string())),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// tungstenite adapter (client connect path)
// ─────────────────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TungsteniteSink(SplitSink<WsStream, tokio_tungstenite::tungstenite::Message>);
struct TungsteniteSource(SplitStream<WsStream>);

/// Dials a WebSocket URL and returns the transport halves.
pub async fn connect(url: &str) -> Result<(BoxFrameSink, BoxFrameSource), TransportError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::Ws(e.to_string()))?;
    Ok(from_tungstenite(stream))
}

/// Wraps an already-connected tungstenite stream.
pub fn from_tungstenite(stream: WsStream) -> (BoxFrameSink, BoxFrameSource) {
    let (sink, source) = stream.split();
    (
        Box::new(TungsteniteSink(sink)),
        Box::new(TungsteniteSource(source)),
    )
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::Message;
        let msg = match frame {
            WireFrame::Text(text) => Message::Text(text.into()),
            WireFrame::Binary(data) => Message::Binary(data),
            WireFrame::Ping => Message::Ping(Bytes::new()),
            WireFrame::Pong => Message::Pong(Bytes::new()),
            WireFrame::Close => Message::Close(None),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>> {
        use tokio_tungstenite::tungstenite::Message;
        loop {
            let item = self.0.next().await?;
            return Some(match item {
                Ok(Message::Text(text)) => Ok(WireFrame::Text(text.to_string())),
                Ok(Message::Binary(data)) => Ok(WireFrame::Binary(data)),
                Ok(Message::Ping(_)) => Ok(WireFrame::Ping),
                Ok(Message::Pong(_)) => Ok(WireFrame::Pong),
                Ok(Message::Close(_)) => Ok(WireFrame::Close),
                Ok(Message::Frame(_)) => continue,
                Err(e) => Err(TransportError::Ws(e.to_string())),
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory adapter (tests and loopback)
// ─────────────────────────────────────────────────────────────────────────────

struct MemorySink(tokio::sync::mpsc::UnboundedSender<WireFrame>);
struct MemorySource(tokio::sync::mpsc::UnboundedReceiver<WireFrame>);

/// Creates two connected in-memory transports: what one side sends, the
/// other receives.
pub fn memory_pair() -> (
    (BoxFrameSink, BoxFrameSource),
    (BoxFrameSink, BoxFrameSource),
) {
    let (a_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
    let (b_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
    (
        (Box::new(MemorySink(a_tx)), Box::new(MemorySource(a_rx))),
        (Box::new(MemorySink(b_tx)), Box::new(MemorySource(b_rx))),
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        self.0.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        let _ = self.0.send(WireFrame::Close);
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next(&mut self) -> Option<Result<WireFrame, TransportError>> {
        self.0.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_is_full_duplex() {
        let ((mut a_tx, mut a_rx), (mut b_tx, mut b_rx)) = memory_pair();

        a_tx.send(WireFrame::Text("hello".into())).await.unwrap();
        assert_eq!(
            b_rx.next().await.unwrap().unwrap(),
            WireFrame::Text("hello".into())
        );

        b_tx.send(WireFrame::Binary(Bytes::from_static(&[1, 2])))
            .await
            .unwrap();
        assert_eq!(
            a_rx.next().await.unwrap().unwrap(),
            WireFrame::Binary(Bytes::from_static(&[1, 2]))
        );
    }

    #[tokio::test]
    async fn memory_close_surfaces_as_close_frame() {
        let ((mut a_tx, _a_rx), (_b_tx, mut b_rx)) = memory_pair();
        a_tx.close().await;
        drop(a_tx);
        assert_eq!(b_rx.next().await.unwrap().unwrap(), WireFrame::Close);
        assert!(b_rx.next().await.is_none());
    }
}
