//! Duplex message channel between one client connection and its session.

use std::future::Future;
use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use sandbox_session_error::SessionError;
use thiserror::Error;

pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One inbound message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed")]
    Closed,
}

impl From<ChannelError> for SessionError {
    fn from(value: ChannelError) -> Self {
        SessionError::Channel {
            message: value.to_string(),
        }
    }
}

/// Bidirectional message transport used by a session.
///
/// `recv` yields `None` once the peer closed the connection. It must be
/// cancel safe: the lifecycle races it against idle and shutdown timers.
pub trait DuplexChannel: Send {
    fn recv(&mut self) -> ChannelFuture<'_, Option<Result<Frame, ChannelError>>>;

    fn send(&mut self, text: String) -> ChannelFuture<'_, Result<(), ChannelError>>;

    /// Closes the connection. Errors are ignored; the peer may already be gone.
    fn close(&mut self) -> ChannelFuture<'_, ()>;
}

/// [`DuplexChannel`] over an upgraded axum WebSocket.
pub struct WebSocketChannel {
    socket: WebSocket,
    closed: bool,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

impl DuplexChannel for WebSocketChannel {
    fn recv(&mut self) -> ChannelFuture<'_, Option<Result<Frame, ChannelError>>> {
        Box::pin(async move {
            if self.closed {
                return None;
            }
            loop {
                match self.socket.recv().await {
                    None => return None,
                    Some(Err(err)) => return Some(Err(ChannelError::Transport(err.to_string()))),
                    Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text))),
                    Some(Ok(Message::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes))),
                    // axum answers pings on its own.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        self.closed = true;
                        return None;
                    }
                }
            }
        })
    }

    fn send(&mut self, text: String) -> ChannelFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if self.closed {
                return Err(ChannelError::Closed);
            }
            self.socket
                .send(Message::Text(text))
                .await
                .map_err(|err| ChannelError::Transport(err.to_string()))
        })
    }

    fn close(&mut self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return;
            }
            self.closed = true;
            let _ = self.socket.send(Message::Close(None)).await;
        })
    }
}
