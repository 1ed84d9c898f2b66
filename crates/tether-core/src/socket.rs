//! Message socket abstraction for the event leg.
//!
//! Both peers only need four things from a WebSocket: send a binary frame,
//! receive the next binary frame, ping, and close. [`FrameSocket`] captures
//! that so the pump and the listener can run over axum's server socket, a
//! tokio-tungstenite client socket, or an in-memory pair in tests.

use async_trait::async_trait;
use thiserror::Error;

/// Socket failure.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    #[error("socket closed")]
    Closed,

    #[error("socket error: {0}")]
    Transport(String),
}

/// A binary message socket.
#[async_trait]
pub trait FrameSocket: Send + 'static {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SocketError>;

    /// Next binary frame; control frames are handled internally.
    ///
    /// `None` once the peer has closed the socket.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, SocketError>>;

    async fn ping(&mut self) -> Result<(), SocketError>;

    async fn close(&mut self) -> Result<(), SocketError>;
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    enum Frame {
        Data(Vec<u8>),
        Ping,
        Close,
    }

    /// One end of an in-memory socket pair.
    pub struct MemorySocket {
        tx: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Frame>,
        pings: Arc<AtomicUsize>,
        closed: bool,
    }

    impl MemorySocket {
        /// Pings received from the peer so far.
        pub fn pings(&self) -> Arc<AtomicUsize> {
            self.pings.clone()
        }
    }

    pub fn pair() -> (MemorySocket, MemorySocket) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemorySocket {
                tx: a_tx,
                rx: b_rx,
                pings: Arc::new(AtomicUsize::new(0)),
                closed: false,
            },
            MemorySocket {
                tx: b_tx,
                rx: a_rx,
                pings: Arc::new(AtomicUsize::new(0)),
                closed: false,
            },
        )
    }

    #[async_trait]
    impl FrameSocket for MemorySocket {
        async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SocketError> {
            if self.closed {
                return Err(SocketError::Closed);
            }
            self.tx.send(Frame::Data(frame)).map_err(|_| SocketError::Closed)
        }

        async fn next_frame(&mut self) -> Option<Result<Vec<u8>, SocketError>> {
            loop {
                match self.rx.recv().await? {
                    Frame::Data(data) => return Some(Ok(data)),
                    Frame::Ping => {
                        self.pings.fetch_add(1, Ordering::SeqCst);
                    }
                    Frame::Close => {
                        self.closed = true;
                        return None;
                    }
                }
            }
        }

        async fn ping(&mut self) -> Result<(), SocketError> {
            self.tx.send(Frame::Ping).map_err(|_| SocketError::Closed)
        }

        async fn close(&mut self) -> Result<(), SocketError> {
            self.closed = true;
            let _ = self.tx.send(Frame::Close);
            Ok(())
        }
    }
}
