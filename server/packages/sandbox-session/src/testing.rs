//! In-process channel used to drive sessions without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, ChannelFuture, DuplexChannel, Frame};

pub use crate::provider::{MockProvider, ProviderCall};

/// Creates a connected channel pair: the server end runs a session, the
/// client end plays the remote peer.
pub fn memory_channel() -> (MemoryChannel, MemoryClient) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryChannel {
            inbound: inbound_rx,
            outbound: outbound_tx,
            closed: closed.clone(),
        },
        MemoryClient {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            closed,
        },
    )
}

#[derive(Debug)]
pub struct MemoryChannel {
    inbound: mpsc::UnboundedReceiver<Result<Frame, ChannelError>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl DuplexChannel for MemoryChannel {
    fn recv(&mut self) -> ChannelFuture<'_, Option<Result<Frame, ChannelError>>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inbound.recv().await
        })
    }

    fn send(&mut self, text: String) -> ChannelFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.outbound.send(text).map_err(|_| ChannelError::Closed)
        })
    }

    fn close(&mut self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}

#[derive(Debug)]
pub struct MemoryClient {
    inbound: Option<mpsc::UnboundedSender<Result<Frame, ChannelError>>>,
    outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl MemoryClient {
    pub fn send_text(&self, text: impl Into<String>) {
        self.push(Ok(Frame::Text(text.into())));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, bytes: impl Into<Vec<u8>>) {
        self.push(Ok(Frame::Binary(bytes.into())));
    }

    /// Simulates a broken transport on the next receive.
    pub fn break_transport(&self, message: impl Into<String>) {
        self.push(Err(ChannelError::Transport(message.into())));
    }

    /// Closes the client side; the session sees the channel as closed.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Whether the server side closed the channel.
    pub fn is_closed_by_server(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next text frame written by the server, parsed as JSON.
    pub async fn next_json(&mut self, timeout: Duration) -> Option<Value> {
        let text = tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()?;
        serde_json::from_str(&text).ok()
    }

    fn push(&self, frame: Result<Frame, ChannelError>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(frame);
        }
    }
}
