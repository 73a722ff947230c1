//! Shared test doubles: a channel-backed transport and a recording registrar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use logship_publisher::endpoint::transport::{
    AddressPool, ClientFrame, Connection, Connector, ServerFrame,
};
use logship_publisher::{AckEvent, Cursor, Event, Registrar, Spool, TransportError};

/// The remote half of one mock connection: what the publisher sent, and a
/// way to answer it.
pub struct RemoteConn {
    pub server: String,
    pub sent: mpsc::Receiver<ClientFrame>,
    pub respond: mpsc::Sender<ServerFrame>,
}

/// Connector that hands the remote half of every connection to the test.
pub struct MockConnector {
    connections: mpsc::UnboundedSender<RemoteConn>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        server: &str,
        _pool: &AddressPool,
    ) -> Result<Connection, TransportError> {
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
        self.connections
            .send(RemoteConn {
                server: server.to_string(),
                sent: out_rx,
                respond: in_tx,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

pub fn mock_connector() -> (Arc<MockConnector>, mpsc::UnboundedReceiver<RemoteConn>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(MockConnector { connections: tx }), rx)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarCall {
    Add {
        source: String,
        offset: u64,
        lines: usize,
    },
    Send,
}

/// Registrar that records every call for later assertion.
#[derive(Clone, Default)]
pub struct RecordingRegistrar {
    calls: Arc<Mutex<Vec<RegistrarCall>>>,
    closed: Arc<AtomicBool>,
}

impl Registrar for RecordingRegistrar {
    fn add(&mut self, ack: AckEvent) {
        self.calls.lock().expect("registrar lock").push(RegistrarCall::Add {
            source: ack.cursor.source.to_string(),
            offset: ack.cursor.offset,
            lines: ack.lines,
        });
    }

    fn send(&mut self) {
        self.calls
            .lock()
            .expect("registrar lock")
            .push(RegistrarCall::Send);
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl RecordingRegistrar {
    pub fn calls(&self) -> Vec<RegistrarCall> {
        self.calls.lock().expect("registrar lock").clone()
    }

    /// Just the rollups, in the order the registrar saw them.
    pub fn added(&self) -> Vec<(String, u64, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RegistrarCall::Add {
                    source,
                    offset,
                    lines,
                } => Some((source, offset, lines)),
                RegistrarCall::Send => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Spool of `count` events; offsets step by 100 so rollup cursors are easy
/// to assert.
pub fn spool(source: &str, count: usize) -> Spool {
    (0..count)
        .map(|i| {
            Event::new(
                format!("{source} line {i}"),
                Cursor::new(source, (i as u64 + 1) * 100),
            )
        })
        .collect()
}

/// Receive the next payload transmission from a remote, failing the test on
/// anything else or on timeout.
pub async fn recv_events(remote: &mut RemoteConn) -> (u64, Vec<Event>) {
    match recv_frame(remote).await {
        ClientFrame::Events { seq, events } => (seq, events),
        ClientFrame::Ping => panic!("expected events, remote received a ping"),
    }
}

/// Receive the next keepalive ping from a remote.
pub async fn recv_ping(remote: &mut RemoteConn) {
    match recv_frame(remote).await {
        ClientFrame::Ping => (),
        ClientFrame::Events { seq, .. } => {
            panic!("expected ping, remote received payload {seq}")
        }
    }
}

pub async fn recv_frame(remote: &mut RemoteConn) -> ClientFrame {
    tokio::time::timeout(Duration::from_secs(2), remote.sent.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for a frame from {}", remote.server))
        .unwrap_or_else(|| panic!("publisher closed the connection to {}", remote.server))
}

/// Assert that nothing arrives at the remote for a little while.
pub async fn expect_silence(remote: &mut RemoteConn) {
    let outcome = tokio::time::timeout(Duration::from_millis(150), remote.sent.recv()).await;
    assert!(outcome.is_err(), "remote unexpectedly received {outcome:?}");
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
