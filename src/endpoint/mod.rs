//! Per-remote endpoint state machines and their multiplexing sink.
//!
//! An [`Endpoint`] is the publisher's handle on one remote collector: it owns
//! the pending set of payloads outstanding on that remote, translates typed
//! responses into acknowledgment outcomes, and hands transmissions off to a
//! transport worker without ever blocking the dispatcher.
//!
//! The [`sink::EndpointSink`] owns every endpoint plus its worker task and
//! funnels their asynchronous output onto the three channels the dispatcher
//! multiplexes: ready, responses, failures.

pub mod sink;
pub mod transport;

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PublishError, TransportError};
use crate::payload::PendingPayload;
use crate::publisher::inflight::InflightQueue;

use self::sink::AckResponse;
use self::transport::{AddressPool, ClientFrame};

/// Index of an endpoint within its sink. Stable for the publisher's lifetime;
/// endpoints are registered at construction only.
pub type EndpointId = usize;

/// Commands the dispatcher hands to an endpoint's transport worker.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Put a frame on the wire.
    Send(ClientFrame),
    /// Drop the current connection (if any) and establish a new one.
    Reconnect,
}

/// Result of applying one acknowledgment to an endpoint's pending payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AckOutcome {
    /// Source-order sequence of the acknowledged payload.
    pub seq: u64,
    /// Whether this was the payload's first acknowledgment.
    pub first_ack: bool,
    /// Whether the payload is now fully acknowledged.
    pub complete: bool,
}

/// Dispatcher-side state machine for one remote collector.
///
/// All mutation happens on the dispatcher task. The transport worker only
/// sees this endpoint through its command channel and the sink envelopes,
/// which carry a connection epoch so the dispatcher can discard output from
/// connections it has already written off.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    server: String,
    pool: AddressPool,
    pending: VecDeque<u64>,
    pinging: bool,
    ready: bool,
    full: bool,
    /// Epoch of the connection the dispatcher currently trusts.
    epoch: u64,
    /// Envelopes from connections below this epoch are stale.
    min_epoch: u64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl Endpoint {
    pub(crate) fn new(
        id: EndpointId,
        server: String,
        pool: AddressPool,
        commands: mpsc::UnboundedSender<WorkerCommand>,
    ) -> Self {
        Endpoint {
            id,
            server,
            pool,
            pending: VecDeque::new(),
            pinging: false,
            ready: false,
            full: false,
            epoch: 0,
            min_epoch: 0,
            commands,
        }
    }

    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[must_use]
    pub fn address_pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Payloads outstanding on this endpoint.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether a keepalive ping is awaiting its pong.
    #[must_use]
    pub fn is_pinging(&self) -> bool {
        self.pinging
    }

    /// Track a payload as outstanding and emit it on the transport.
    ///
    /// Success means the transmission was handed to the worker, not that it
    /// was delivered; delivery is confirmed by acknowledgment only.
    pub(crate) fn send_payload(&mut self, payload: &PendingPayload) -> Result<(), PublishError> {
        self.pending.push_back(payload.seq());
        self.send_command(WorkerCommand::Send(ClientFrame::Events {
            seq: payload.seq(),
            events: payload.wire_events().to_vec(),
        }))
    }

    /// Emit a keepalive ping and expect a pong within the network timeout.
    pub(crate) fn send_ping(&mut self) -> Result<(), PublishError> {
        self.pinging = true;
        self.send_command(WorkerCommand::Send(ClientFrame::Ping))
    }

    /// Apply an acknowledgment to the matching pending payload.
    ///
    /// Completed payloads leave the pending set but stay in the in-flight
    /// queue until the ordered drain walks past them.
    pub(crate) fn process_ack(
        &mut self,
        ack: &AckResponse,
        inflight: &mut InflightQueue,
    ) -> Result<AckOutcome, PublishError> {
        if !self.pending.contains(&ack.payload_seq) {
            return Err(PublishError::Protocol(format!(
                "Acknowledgment for unknown payload {}",
                ack.payload_seq
            )));
        }

        let payload = inflight.get_mut(ack.payload_seq).ok_or_else(|| {
            PublishError::BugAssertion(format!(
                "Pending payload {} missing from the in-flight queue",
                ack.payload_seq
            ))
        })?;

        let first_ack = payload.ack_from_wire(ack.sequence)?;
        let complete = payload.complete();
        if complete {
            self.pending.retain(|&seq| seq != ack.payload_seq);
        }

        Ok(AckOutcome {
            seq: ack.payload_seq,
            first_ack,
            complete,
        })
    }

    /// Accept a pong. A pong with no ping outstanding is a protocol
    /// violation.
    pub(crate) fn process_pong(&mut self) -> Result<(), PublishError> {
        if !self.pinging {
            return Err(PublishError::Protocol("Unexpected PONG received".into()));
        }
        self.pinging = false;
        Ok(())
    }

    /// Strip the pending set for redelivery after a failure.
    pub(crate) fn take_pending(&mut self) -> VecDeque<u64> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear_pinging(&mut self) {
        self.pinging = false;
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.full
    }

    pub(crate) fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    /// Whether the dispatcher has written the current connection off and is
    /// waiting for the worker to come back with a newer one.
    pub(crate) fn is_failed(&self) -> bool {
        self.epoch < self.min_epoch
    }

    /// Whether an envelope from connection `epoch` belongs to a connection
    /// this endpoint has already failed.
    pub(crate) fn is_stale(&self, epoch: u64) -> bool {
        epoch < self.min_epoch
    }

    /// Adopt the connection a ready notification announced.
    pub(crate) fn accept_epoch(&mut self, epoch: u64) {
        if epoch > self.epoch {
            debug!(server = %self.server, epoch, "Endpoint connection established");
        }
        self.epoch = self.epoch.max(epoch);
    }

    /// Write the current connection off. Output from it (and from any failed
    /// attempt `failed_epoch`) becomes stale.
    pub(crate) fn mark_failed(&mut self, failed_epoch: Option<u64>) {
        let mut min = self.min_epoch.max(self.epoch + 1);
        if let Some(epoch) = failed_epoch {
            min = min.max(epoch + 1);
        }
        self.min_epoch = min;
    }

    fn send_command(&self, command: WorkerCommand) -> Result<(), PublishError> {
        self.commands
            .send(command)
            .map_err(|_| PublishError::Transport(TransportError::WorkerGone))
    }
}
