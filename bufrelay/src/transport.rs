//! Transport seam
//!
//! The byte-level encoding and the socket live outside this crate. What the
//! buffer layer needs from a transport is: send a message, tell whether the
//! connection is up, and wait until it is. Inbound replies are pushed into a
//! `ReplyCorrelator` by whoever owns the receive side.

use std::future::Future;

use tokio::sync::{mpsc, watch};

use crate::error::Error;
use crate::message::Message;

/// Outbound half of a connection to the audio server
pub trait Transport: Send + Sync + 'static {
    /// Send one message. Success means "handed to the transport", not "applied".
    ///
    /// # Errors
    ///
    /// `NotConnected` if there is no connection.
    fn send(&self, message: Message) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Resolve once the connection is established
    fn wait_connected(&self) -> impl Future<Output = ()> + Send;
}

/// Transport that forwards outbound messages into a channel
///
/// The receiving end is meant for a socket task that encodes and writes the
/// messages. Pair it with `ReplyCorrelator::run_inbound` for the other
/// direction.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Message>,
    connected: watch::Sender<bool>,
}

impl ChannelTransport {
    /// Create a transport in the disconnected state
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        (
            Self {
                outbound,
                connected,
            },
            rx,
        )
    }

    /// Report a connection state change from the socket task
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: Message) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        log::trace!("transport.send: {message}");
        self.outbound.send(message).map_err(|_| Error::TransportLost)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn wait_connected(&self) -> impl Future<Output = ()> + Send {
        let mut rx = self.connected.subscribe();
        async move {
            // Err: transport dropped; nothing left to wait for
            let _ = rx.wait_for(|up| *up).await;
        }
    }
}
