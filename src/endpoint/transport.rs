//! Transport contract between the publisher core and the wire.
//!
//! Byte framing, TLS, and the codec live behind [`Connector`]; the core only
//! ever sees typed frames. A [`Connection`] is a duplex pair of channels the
//! endpoint worker drives: client frames out, server frames in.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::Event;

/// Frames the publisher puts on the wire.
#[derive(Debug)]
pub enum ClientFrame {
    /// A payload transmission. `seq` identifies the payload in later
    /// acknowledgments; wire acknowledgment sequences count events within
    /// this transmission, starting at one.
    Events { seq: u64, events: Vec<Event> },
    /// Keepalive probe; the remote answers with a pong.
    Ping,
}

/// Frames the remote sends back.
#[derive(Debug, Clone, Copy)]
pub enum ServerFrame {
    /// Cumulative acknowledgment: `upto` events of payload `seq` are
    /// persisted. Partial acknowledgments are allowed and repeatable.
    Ack { seq: u64, upto: usize },
    /// Keepalive answer.
    Pong,
}

/// An established connection to one remote collector.
#[derive(Debug)]
pub struct Connection {
    /// Outbound frames toward the remote.
    pub outbound: mpsc::Sender<ClientFrame>,
    /// Inbound frames from the remote. FIFO per connection.
    pub inbound: mpsc::Receiver<ServerFrame>,
}

/// Resolution handle for one server identifier.
///
/// Hostname-to-address rotation happens inside the connector; the publisher
/// only carries the handle from configuration to `connect`.
#[derive(Debug, Clone)]
pub struct AddressPool {
    server: String,
}

impl AddressPool {
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        AddressPool {
            server: server.into(),
        }
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }
}

/// Factory for connections; implemented by the real transport and by test
/// doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `server`, resolving addresses through the
    /// pool. Retrying and backoff are the caller's concern.
    async fn connect(
        &self,
        server: &str,
        pool: &AddressPool,
    ) -> Result<Connection, TransportError>;
}
