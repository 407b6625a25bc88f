//! Duplex message transport between the caller and the engine host.
//!
//! The engine runs in an isolated execution context; the only interaction
//! with it is message passing over this pipe. [`pair`] creates the two
//! endpoints: the caller side is handed to
//! [`MessageChannel`](crate::channel::MessageChannel), the host side to
//! whatever drives the engine (in tests, a scripted mock host task).

use tokio::sync::mpsc;

use crate::protocol::Message;

/// Default bound for each direction of the pipe.
pub const DEFAULT_CAPACITY: usize = 64;

/// Caller-side endpoint.
pub struct Transport {
    pub(crate) tx: mpsc::Sender<Message>,
    pub(crate) rx: mpsc::Receiver<Message>,
}

/// Host-side endpoint.
pub struct HostEndpoint {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl HostEndpoint {
    /// Receive the next message from the caller.
    ///
    /// Returns `None` once the caller side is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Send a message to the caller.
    ///
    /// Returns `false` if the caller side is gone.
    pub async fn send(&self, message: Message) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Clone of the host-to-caller sender, for host tasks that answer out
    /// of band (e.g. streaming chunks while still accepting new requests).
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }
}

/// Create a connected transport pair with [`DEFAULT_CAPACITY`].
pub fn pair_default() -> (Transport, HostEndpoint) {
    pair(DEFAULT_CAPACITY)
}

/// Create a connected transport pair with the given per-direction capacity.
pub fn pair(capacity: usize) -> (Transport, HostEndpoint) {
    let (caller_tx, host_rx) = mpsc::channel(capacity);
    let (host_tx, caller_rx) = mpsc::channel(capacity);
    (
        Transport {
            tx: caller_tx,
            rx: caller_rx,
        },
        HostEndpoint {
            tx: host_tx,
            rx: host_rx,
        },
    )
}
