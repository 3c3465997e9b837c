//! Bidirectional message channels between two parties.
//!
//! An [`Endpoint`] is one end of a pair. Messages sent on one end arrive, in
//! order, on the other. Along with each message an endpoint can hand over
//! further endpoints (the transfer list), which is how sub-channels for
//! remoted objects are established.

use std::fmt;

use tokio::sync::mpsc;

use crate::error::{Result, RpcError};
use crate::message::Message;

/// A message together with the endpoints whose ownership moves with it.
#[derive(Debug)]
pub struct Envelope {
    pub message: Message,
    pub transfer: Vec<Endpoint>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(message: Message, transfer: Vec<Endpoint>) -> Self {
        Self { message, transfer }
    }
}

/// The sending half of an endpoint. Cheap to clone.
#[derive(Clone)]
pub struct EndpointSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EndpointSender {
    /// Post an envelope to the other end.
    ///
    /// Fails only when the other end has been dropped or closed.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| RpcError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for EndpointSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// The receiving half of an endpoint.
pub struct EndpointReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl EndpointReceiver {
    /// Wait for the next envelope. Returns `None` once every sender on the
    /// other end is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Stop accepting messages. Envelopes already queued can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl fmt::Debug for EndpointReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointReceiver").finish_non_exhaustive()
    }
}

/// One end of a bidirectional channel.
#[derive(Debug)]
pub struct Endpoint {
    sender: EndpointSender,
    receiver: EndpointReceiver,
}

impl Endpoint {
    /// Create a connected pair. Each end's sends arrive at the other.
    pub fn pair() -> (Endpoint, Endpoint) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let a = Endpoint {
            sender: EndpointSender { tx: tx1 },
            receiver: EndpointReceiver { rx: rx2 },
        };
        let b = Endpoint {
            sender: EndpointSender { tx: tx2 },
            receiver: EndpointReceiver { rx: rx1 },
        };

        (a, b)
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.sender.send(envelope)
    }

    /// Shorthand for sending a message with no transfer list.
    pub fn post(&self, message: Message) -> Result<()> {
        self.sender.send(Envelope::new(message))
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    pub fn sender(&self) -> EndpointSender {
        self.sender.clone()
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (EndpointSender, EndpointReceiver) {
        (self.sender, self.receiver)
    }

    /// Close both directions. The other end sees its receiver drain and end.
    pub fn close(self) {
        let (sender, mut receiver) = self.split();
        receiver.close();
        drop(sender);
    }
}
