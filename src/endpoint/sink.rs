//! Endpoint collection and output multiplexing.
//!
//! The sink owns every endpoint together with the transport worker task that
//! drives its connection. Workers never touch dispatcher state: everything
//! they produce flows through three channels the dispatcher multiplexes.
//!
//! ```text
//!   worker 0 ──┐
//!   worker 1 ──┼── ready ────────┐
//!   worker n ──┘                 │
//!              ┌── responses ────┼──> dispatcher select loop
//!              └── failures ─────┘
//! ```
//!
//! Every envelope carries the connection epoch it originated from. The
//! dispatcher fails connections it has given up on; envelopes from those
//! epochs are discarded instead of corrupting a newer connection's state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PublishError, TransportError};

use super::transport::{AddressPool, Connection, Connector, ServerFrame};
use super::{Endpoint, EndpointId, WorkerCommand};

/// Capacity of each sink channel; sized for a fleet, not a firehose — each
/// endpoint has at most a handful of envelopes outstanding.
const SINK_CHANNEL_CAPACITY: usize = 64;

/// Cumulative acknowledgment from a remote collector.
#[derive(Debug, Clone, Copy)]
pub struct AckResponse {
    /// Payload the remote is acknowledging.
    pub payload_seq: u64,
    /// Events acknowledged within the current transmission, from one.
    pub sequence: usize,
}

/// Typed response from a remote collector.
#[derive(Debug, Clone, Copy)]
pub enum EndpointResponse {
    Ack(AckResponse),
    Pong,
}

/// An endpoint became able to send: connection established, or a previous
/// transmission was handed to the wire.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEnvelope {
    pub endpoint: EndpointId,
    pub(crate) epoch: u64,
}

/// A response arrived from an endpoint's remote.
#[derive(Debug, Clone, Copy)]
pub struct ResponseEnvelope {
    pub endpoint: EndpointId,
    pub(crate) epoch: u64,
    pub response: EndpointResponse,
}

/// An endpoint's transport failed.
#[derive(Debug)]
pub struct FailureEnvelope {
    pub endpoint: EndpointId,
    pub(crate) epoch: u64,
    pub error: PublishError,
}

/// Owns the endpoint fleet and its transport workers.
pub struct EndpointSink {
    endpoints: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    pub(crate) ready_rx: mpsc::Receiver<ReadyEnvelope>,
    pub(crate) response_rx: mpsc::Receiver<ResponseEnvelope>,
    pub(crate) fail_rx: mpsc::Receiver<FailureEnvelope>,
    ready_tx: mpsc::Sender<ReadyEnvelope>,
    response_tx: mpsc::Sender<ResponseEnvelope>,
    fail_tx: mpsc::Sender<FailureEnvelope>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl EndpointSink {
    pub(crate) fn new(connector: Arc<dyn Connector>, reconnect_delay: Duration) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let (fail_tx, fail_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);

        EndpointSink {
            endpoints: Vec::new(),
            connector,
            reconnect_delay,
            ready_rx,
            response_rx,
            fail_rx,
            ready_tx,
            response_tx,
            fail_tx,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Register an endpoint and spawn its transport worker. Endpoints are
    /// added at construction only; the fleet never changes afterwards.
    pub(crate) fn add_endpoint(&mut self, server: &str, pool: AddressPool) -> EndpointId {
        let id = self.endpoints.len();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.endpoints
            .push(Endpoint::new(id, server.to_string(), pool.clone(), command_tx));

        let worker = EndpointWorker {
            id,
            server: server.to_string(),
            pool,
            connector: Arc::clone(&self.connector),
            reconnect_delay: self.reconnect_delay,
            commands: command_rx,
            ready_tx: self.ready_tx.clone(),
            response_tx: self.response_tx.clone(),
            fail_tx: self.fail_tx.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.workers.push(tokio::spawn(worker.run()));

        id
    }

    pub(crate) fn endpoint(&self, id: EndpointId) -> &Endpoint {
        &self.endpoints[id]
    }

    pub(crate) fn endpoint_mut(&mut self, id: EndpointId) -> &mut Endpoint {
        &mut self.endpoints[id]
    }

    pub(crate) fn num_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    /// Ask an endpoint's worker to tear its connection down and establish a
    /// fresh one. Used after dispatcher-detected failures; a worker that
    /// already lost its connection reconnects on its own.
    pub(crate) fn request_reconnect(&self, id: EndpointId) {
        let _ = self.endpoints[id].send_command_reconnect();
    }

    /// Signal every worker to stop.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Join every worker. Call after [`EndpointSink::shutdown`].
    pub(crate) async fn wait(&mut self) {
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                warn!("Endpoint worker terminated abnormally: {err}");
            }
        }
    }
}

impl Endpoint {
    fn send_command_reconnect(&self) -> Result<(), PublishError> {
        self.send_command(WorkerCommand::Reconnect)
    }
}

/// Transport worker for one endpoint.
///
/// Lifecycle: connect (retrying with a delay), announce readiness, then pump
/// commands out and frames in until the connection dies or a reconnect is
/// requested. Connection attempts are numbered; every envelope carries the
/// number so the dispatcher can tell output of dead connections apart.
struct EndpointWorker {
    id: EndpointId,
    server: String,
    pool: AddressPool,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ready_tx: mpsc::Sender<ReadyEnvelope>,
    response_tx: mpsc::Sender<ResponseEnvelope>,
    fail_tx: mpsc::Sender<FailureEnvelope>,
    shutdown: CancellationToken,
}

impl EndpointWorker {
    async fn run(mut self) {
        let mut epoch: u64 = 0;

        'reconnect: loop {
            let connection = match self.establish(&mut epoch).await {
                Some(connection) => connection,
                None => return,
            };
            let Connection {
                outbound,
                mut inbound,
            } = connection;

            if self
                .ready_tx
                .send(ReadyEnvelope {
                    endpoint: self.id,
                    epoch,
                })
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => return,
                    command = self.commands.recv() => match command {
                        Some(WorkerCommand::Send(frame)) => {
                            if outbound.send(frame).await.is_err() {
                                if self.report_failure(epoch, TransportError::Closed).await.is_err() {
                                    return;
                                }
                                continue 'reconnect;
                            }
                            // Transmission handed off; we can take another
                            if self
                                .ready_tx
                                .send(ReadyEnvelope { endpoint: self.id, epoch })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Some(WorkerCommand::Reconnect) => {
                            debug!(server = %self.server, "Reconnect requested, dropping connection");
                            continue 'reconnect;
                        }
                        None => return,
                    },
                    frame = inbound.recv() => match frame {
                        Some(frame) => {
                            let response = match frame {
                                ServerFrame::Ack { seq, upto } => EndpointResponse::Ack(AckResponse {
                                    payload_seq: seq,
                                    sequence: upto,
                                }),
                                ServerFrame::Pong => EndpointResponse::Pong,
                            };
                            let envelope = ResponseEnvelope {
                                endpoint: self.id,
                                epoch,
                                response,
                            };
                            if self.response_tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            if self.report_failure(epoch, TransportError::Closed).await.is_err() {
                                return;
                            }
                            continue 'reconnect;
                        }
                    },
                }
            }
        }
    }

    /// Connect, retrying with the configured delay until the sink shuts down.
    /// Returns `None` on shutdown. Failed attempts are reported so the
    /// dispatcher can log them against the endpoint.
    async fn establish(&mut self, epoch: &mut u64) -> Option<Connection> {
        loop {
            *epoch += 1;

            let attempt = tokio::select! {
                () = self.shutdown.cancelled() => return None,
                result = self.connector.connect(&self.server, &self.pool) => result,
            };

            match attempt {
                Ok(connection) => return Some(connection),
                Err(err) => {
                    debug!(server = %self.server, "Connect attempt failed: {err}");
                    if self.report_failure(*epoch, err).await.is_err() {
                        return None;
                    }
                    if !self.back_off().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn report_failure(
        &self,
        epoch: u64,
        error: TransportError,
    ) -> Result<(), mpsc::error::SendError<FailureEnvelope>> {
        self.fail_tx
            .send(FailureEnvelope {
                endpoint: self.id,
                epoch,
                error: error.into(),
            })
            .await
    }

    /// Sleep out the reconnect delay, absorbing commands. Sends that arrive
    /// while disconnected are dropped; their payloads stay pending on the
    /// endpoint and come back through the timeout path.
    async fn back_off(&mut self) -> bool {
        let delay = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = &mut delay => return true,
                command = self.commands.recv() => match command {
                    Some(_) => continue,
                    None => return false,
                },
            }
        }
    }
}
