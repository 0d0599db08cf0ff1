//! Socket transport
//!
//! Shards talk to the gateway through [`Transport`], which opens a socket and
//! hands back independent writer and reader halves. Production uses
//! tokio-tungstenite; tests plug in an in-memory implementation.

use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Close code used when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// A frame as seen by the shard state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseFrame>),
}

/// Outbound half of an open socket
#[async_trait]
pub trait SocketWriter: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError>;
}

/// Inbound half of an open socket
#[async_trait]
pub trait SocketReader: Send {
    /// Next text or close frame; `None` once the socket is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, GatewayError>>;
}

/// An open socket split into halves
pub struct Connection {
    pub writer: Box<dyn SocketWriter>,
    pub reader: Box<dyn SocketReader>,
}

/// Opens sockets to the gateway
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Connection, GatewayError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite backed transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Connection, GatewayError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(GatewayError::transport)?;

        debug!(url, "Socket connected");

        let (sink, stream) = ws.split();
        Ok(Connection {
            writer: Box::new(TungsteniteWriter { sink }),
            reader: Box::new(TungsteniteReader { stream }),
        })
    }
}

struct TungsteniteWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketWriter for TungsteniteWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
                code: CloseCode::from(c.code),
                reason: c.reason.into(),
            })),
        };

        self.sink.send(message).await.map_err(GatewayError::transport)
    }
}

struct TungsteniteReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl SocketReader for TungsteniteReader {
    async fn next_frame(&mut self) -> Option<Result<Frame, GatewayError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(GatewayError::transport(e))),
            };

            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(e) => debug!(error = %e, "Dropping non UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    return Some(Ok(Frame::Close(frame.map(|f| CloseFrame {
                        code: u16::from(f.code),
                        reason: f.reason.as_str().to_owned(),
                    }))))
                }
                // Ping/pong are answered by tungstenite itself
                _ => continue,
            }
        }
    }
}
