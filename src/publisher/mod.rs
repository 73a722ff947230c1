//! The publisher dispatcher: spool intake, endpoint selection, and the
//! ordered acknowledgment drain.
//!
//! # Architecture
//!
//! ```text
//!    Spooler
//!       │ spools
//!       v
//!   ┌────────────┐  payloads   ┌───────────┐   frames    ┌─────────┐
//!   │ Publisher  │ ──────────> │ Endpoint  │ ──────────> │ remote  │
//!   │ (dispatch) │             │ + worker  │ <────────── │collector│
//!   └─────┬──────┘ <────────── └───────────┘  acks/pongs └─────────┘
//!         │          ready / responses / failures
//!         │ ordered rollups
//!         v
//!    Registrar
//! ```
//!
//! The dispatcher is a single cooperative task multiplexing six event
//! sources: endpoint readiness, the (gated) spool channel, responses,
//! failures, the timeout wheel, and a one-second statistics tick, plus the
//! shutdown signal. It owns every piece of mutable state; endpoint workers
//! reach it only through the sink channels.
//!
//! # Ordering
//!
//! Spools dispatch in arrival order, but endpoints acknowledge at their own
//! pace, so a later payload often completes before an earlier one. The
//! registrar must still see acknowledgments in source order — it persists a
//! single monotonic resumption cursor. The drain therefore walks the global
//! in-flight queue from the front, emitting rollups only along the
//! contiguous acknowledged prefix and counting acknowledged stragglers in
//! `out_of_sync` until the prefix reaches them.
//!
//! # Liveness
//!
//! Every endpoint with outstanding payloads carries a pending timeout; every
//! idle endpoint carries a keepalive timeout that pings and then expects a
//! pong within the network timeout. A timeout, transport failure, or
//! protocol violation fails the endpoint: its payloads are requeued for
//! redelivery on the remaining fleet (never losing their place in the global
//! queue) and its transport reconnects.

pub(crate) mod inflight;
pub(crate) mod lists;
pub(crate) mod timeout;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::endpoint::sink::{
    AckResponse, EndpointResponse, EndpointSink, FailureEnvelope, ReadyEnvelope, ResponseEnvelope,
};
use crate::endpoint::transport::{AddressPool, Connector};
use crate::endpoint::EndpointId;
use crate::error::PublishError;
use crate::event::Spool;
use crate::payload::PendingPayload;
use crate::registrar::{NullRegistrar, Registrar};
use crate::stats::{PublisherStats, Snapshot};

use self::inflight::InflightQueue;
use self::lists::{FullList, ReadyList};
use self::timeout::{TimeoutKind, TimeoutWheel};

/// Capacity one suffices: the dispatcher closes its read gate while a spool
/// is parked, so the spooler can never run ahead.
const SPOOL_CHANNEL_CAPACITY: usize = 1;

/// Delay between transport connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

const STATS_TICK: Duration = Duration::from_secs(1);

/// Control handle for a running publisher.
///
/// Cloneable; safe to use from any thread. `snapshot()` reads the statistics
/// block under its read lock and never touches dispatcher state.
#[derive(Clone)]
pub struct PublisherHandle {
    shutdown: CancellationToken,
    done: CancellationToken,
    stats: PublisherStats,
}

impl PublisherHandle {
    /// Request a graceful shutdown. The publisher drains outstanding
    /// payloads before exiting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until the publisher loop has exited and its sink is torn down.
    pub async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.stats.snapshot()
    }
}

/// The publisher core. Construct, hand the spool sender upstream, then
/// consume it with [`Publisher::run`] on the runtime.
pub struct Publisher {
    config: Config,
    sink: EndpointSink,

    inflight: InflightQueue,
    out_of_sync: usize,
    /// Payloads stranded by failed endpoints, awaiting redelivery.
    retry: BTreeSet<u64>,

    ready: ReadyList,
    full: FullList,
    wheel: TimeoutWheel,

    spool_tx: mpsc::Sender<Spool>,
    spool_rx: mpsc::Receiver<Spool>,
    next_spool: Option<Spool>,
    spool_gate_open: bool,
    shutting_down: bool,

    registrar: Box<dyn Registrar>,
    stats: PublisherStats,
    shutdown: CancellationToken,
    done: CancellationToken,
}

impl Publisher {
    /// Build a publisher over the configured server fleet.
    ///
    /// Must be called within a tokio runtime: endpoint transport workers are
    /// spawned here. When `registrar` is `None` acknowledgments are drained
    /// into a no-op registrar.
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        registrar: Option<Box<dyn Registrar>>,
    ) -> Self {
        let mut sink = EndpointSink::new(connector, RECONNECT_DELAY);
        for server in &config.servers {
            sink.add_endpoint(server, AddressPool::new(server.clone()));
        }

        let (spool_tx, spool_rx) = mpsc::channel(SPOOL_CHANNEL_CAPACITY);

        Publisher {
            config,
            sink,
            inflight: InflightQueue::new(),
            out_of_sync: 0,
            retry: BTreeSet::new(),
            ready: ReadyList::default(),
            full: FullList::default(),
            wheel: TimeoutWheel::new(),
            spool_tx,
            spool_rx,
            next_spool: None,
            spool_gate_open: true,
            shutting_down: false,
            registrar: registrar.unwrap_or_else(|| Box::new(NullRegistrar)),
            stats: PublisherStats::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Sender the upstream spooler feeds. May be cloned.
    #[must_use]
    pub fn connect(&self) -> mpsc::Sender<Spool> {
        self.spool_tx.clone()
    }

    #[must_use]
    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle {
            shutdown: self.shutdown.clone(),
            done: self.done.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Run the dispatcher until shutdown completes.
    ///
    /// Exactly one event is handled at a time; the loop suspends only at the
    /// multiplex below. On exit the sink is shut down and joined and the
    /// registrar is closed.
    pub async fn run(mut self) {
        info!(endpoints = self.sink.num_endpoints(), "Publisher starting");
        let mut stats_timer = time::interval_at(Instant::now() + STATS_TICK, STATS_TICK);
        let shutdown = self.shutdown.clone();

        loop {
            let timeout_due = self.wheel.next_due();

            tokio::select! {
                Some(envelope) = self.sink.ready_rx.recv() => {
                    self.handle_ready(envelope);
                }
                spool = self.spool_rx.recv(), if self.spool_gate_open => {
                    match spool {
                        Some(spool) => self.handle_spool(spool),
                        None => {
                            debug!("Spool channel closed, no further spools will arrive");
                            self.spool_gate_open = false;
                        }
                    }
                }
                Some(envelope) = self.sink.response_rx.recv() => {
                    self.handle_response(envelope);
                    if self.shutting_down && self.inflight.is_empty() {
                        debug!("Final ACK received, shutting down");
                        break;
                    }
                }
                Some(envelope) = self.sink.fail_rx.recv() => {
                    self.handle_failure(envelope);
                }
                () = time::sleep_until(timeout_due.unwrap_or_else(far_future)), if timeout_due.is_some() => {
                    self.process_timeouts();
                }
                _ = stats_timer.tick() => {
                    self.stats.tick();
                }
                () = shutdown.cancelled(), if !self.shutting_down => {
                    if self.inflight.is_empty() {
                        debug!("Publisher has no outstanding payloads, shutting down");
                        break;
                    }
                    warn!("Publisher has outstanding payloads, waiting for responses before shutting down");
                    self.shutting_down = true;
                    self.spool_gate_open = false;
                }
            }
        }

        self.sink.shutdown();
        self.sink.wait().await;
        self.registrar.close();
        info!("Publisher exiting");
        self.done.cancel();
    }

    /// An endpoint announced it can take a transmission.
    fn handle_ready(&mut self, envelope: ReadyEnvelope) {
        let endpoint = self.sink.endpoint_mut(envelope.endpoint);
        if endpoint.is_stale(envelope.epoch) {
            debug!(server = %endpoint.server(), "Discarding ready notification from stale connection");
            return;
        }
        endpoint.accept_epoch(envelope.epoch);
        self.register_ready(envelope.endpoint);
    }

    /// Offer an endpoint for dispatch: full endpoints park on the full list,
    /// otherwise stranded retries and the parked spool are served before the
    /// endpoint joins the ready list.
    fn register_ready(&mut self, id: EndpointId) {
        if self.sink.endpoint(id).is_ready() {
            return;
        }

        let pending = self.sink.endpoint(id).num_pending();
        if pending >= self.config.full_threshold {
            let endpoint = self.sink.endpoint_mut(id);
            if endpoint.is_full() {
                return;
            }
            debug!(server = %endpoint.server(), pending, "Endpoint is full");
            endpoint.set_full(true);
            self.full.push(id);
            return;
        }

        if let Some(seq) = self.pop_retry() {
            self.resend_payload(id, seq);
            return;
        }

        if let Some(spool) = self.next_spool.take() {
            debug!(
                server = %self.sink.endpoint(id).server(),
                events = spool.len(),
                "Send is now ready, sending queued events"
            );
            self.send_payload(id, spool);
            self.maybe_reopen_gate();
        } else {
            debug!(server = %self.sink.endpoint(id).server(), "Send is now ready, awaiting new events");
            self.sink.endpoint_mut(id).set_ready(true);
            let sink = &self.sink;
            self.ready
                .insert(id, pending, |other| sink.endpoint(other).num_pending());
            if !self.wheel.is_armed(id) {
                debug!(server = %self.sink.endpoint(id).server(), "Starting keepalive timeout");
                self.wheel.register(
                    id,
                    Instant::now() + self.config.keepalive_timeout,
                    TimeoutKind::Keepalive,
                );
            }
        }
    }

    /// A spool arrived: hand it to the least-loaded ready endpoint, or park
    /// it and close the gate until one becomes ready.
    fn handle_spool(&mut self, spool: Spool) {
        if spool.is_empty() {
            warn!("Dropping empty spool");
            return;
        }

        if let Some(id) = self.ready.pop_front() {
            debug!(
                server = %self.sink.endpoint(id).server(),
                events = spool.len(),
                "New events queued, sending to endpoint"
            );
            self.sink.endpoint_mut(id).set_ready(false);
            self.send_payload(id, spool);
        } else {
            debug!(events = spool.len(), "New events queued, awaiting endpoint readiness");
            self.next_spool = Some(spool);
            self.spool_gate_open = false;
        }
    }

    /// Place a spool in flight on the chosen endpoint.
    fn send_payload(&mut self, id: EndpointId, events: Spool) {
        if events.is_empty() {
            warn!("Dropping empty spool");
            self.register_ready(id);
            return;
        }

        let payload = match self.inflight.push(events) {
            Ok(payload) => payload,
            Err(_) => return,
        };

        // First payload on an idle endpoint starts the pending timeout
        if self.sink.endpoint(id).num_pending() == 0 {
            debug!(server = %self.sink.endpoint(id).server(), "First payload, starting pending timeout");
            self.wheel.register(
                id,
                Instant::now() + self.config.timeout,
                TimeoutKind::Pending,
            );
        }

        let result = self.sink.endpoint_mut(id).send_payload(payload);
        if let Err(err) = result {
            self.fail_endpoint(id, err);
        }

        self.stats.set_pending_payloads(self.inflight.len());
        if self.inflight.len() >= self.config.max_pending_payloads {
            debug!(
                limit = self.config.max_pending_payloads,
                "Pending payload limit reached, pausing spool intake"
            );
            self.spool_gate_open = false;
        }
    }

    /// Retransmit a stranded payload on a newly-ready endpoint. Only the
    /// unacked suffix goes back on the wire.
    fn resend_payload(&mut self, id: EndpointId, seq: u64) {
        if self.sink.endpoint(id).num_pending() == 0 {
            self.wheel.register(
                id,
                Instant::now() + self.config.timeout,
                TimeoutKind::Pending,
            );
        }

        let Some(payload) = self.inflight.get_mut(seq) else {
            return;
        };
        payload.mark_resend();
        debug!(server = %self.sink.endpoint(id).server(), seq, "Retransmitting payload");

        let result = self.sink.endpoint_mut(id).send_payload(payload);
        if let Err(err) = result {
            self.fail_endpoint(id, err);
        }
        self.stats.incr_retries();
    }

    /// Next stranded payload that is still in flight, in source order.
    fn pop_retry(&mut self) -> Option<u64> {
        while let Some(seq) = self.retry.pop_first() {
            if self.inflight.get_mut(seq).is_some() {
                return Some(seq);
            }
        }
        None
    }

    fn handle_response(&mut self, envelope: ResponseEnvelope) {
        let id = envelope.endpoint;
        if self.sink.endpoint(id).is_stale(envelope.epoch) {
            debug!(
                server = %self.sink.endpoint(id).server(),
                "Discarding response from stale connection"
            );
            return;
        }

        let result = match envelope.response {
            EndpointResponse::Ack(ack) => self.process_ack(id, &ack),
            EndpointResponse::Pong => self.process_pong(id),
        };
        if let Err(err) = result {
            self.fail_endpoint(id, err);
        }
    }

    /// Apply an acknowledgment, drain the ordered prefix if it advanced the
    /// head, and reschedule the endpoint's liveness timeout.
    fn process_ack(&mut self, id: EndpointId, ack: &AckResponse) -> Result<(), PublishError> {
        let outcome = self
            .sink
            .endpoint_mut(id)
            .process_ack(ack, &mut self.inflight)?;

        let head_seq = self.inflight.front().map(PendingPayload::seq);
        if head_seq == Some(outcome.seq) {
            self.drain_ordered();
        } else if outcome.first_ack {
            // An out-of-order endpoint got ahead of the head payload
            self.out_of_sync += 1;
        }

        // Expect the next ack within the network timeout while payloads
        // remain; otherwise fall back to idle keepalive
        let pending = self.sink.endpoint(id).num_pending();
        if pending > 0 {
            debug!(server = %self.sink.endpoint(id).server(), "Resetting pending timeout");
            self.wheel.register(
                id,
                Instant::now() + self.config.timeout,
                TimeoutKind::Pending,
            );
        } else {
            debug!(server = %self.sink.endpoint(id).server(), "Last payload acknowledged, starting keepalive timeout");
            self.wheel.register(
                id,
                Instant::now() + self.config.keepalive_timeout,
                TimeoutKind::Keepalive,
            );
        }

        // Acknowledgments may have drained the endpoint below the full
        // threshold; put it back into rotation
        if self.sink.endpoint(id).is_full() && pending < self.config.full_threshold {
            debug!(server = %self.sink.endpoint(id).server(), pending, "Endpoint is no longer full");
            self.sink.endpoint_mut(id).set_full(false);
            self.full.remove(id);
            self.register_ready(id);
        }

        Ok(())
    }

    /// Release the contiguous acknowledged prefix of the in-flight queue to
    /// the registrar, in source order, with exactly one flush at the end.
    fn drain_ordered(&mut self) {
        // The out-of-sync count never includes the head itself, hence the +1;
        // the first payload walked off is always the head, later ones are the
        // out-of-sync stragglers
        let mut out_of_sync = self.out_of_sync + 1;

        while let Some(front) = self.inflight.front_mut() {
            if !front.has_ack() {
                break;
            }
            if let Some(rollup) = front.rollup() {
                self.stats.add_lines(rollup.lines);
                self.registrar.add(rollup);
            }
            if !front.complete() {
                break;
            }
            self.inflight.pop_front();
            out_of_sync -= 1;
            self.out_of_sync = out_of_sync;
        }

        self.registrar.send();
        self.stats.set_pending_payloads(self.inflight.len());
        self.maybe_reopen_gate();
    }

    fn process_pong(&mut self, id: EndpointId) -> Result<(), PublishError> {
        self.sink.endpoint_mut(id).process_pong()?;

        if self.sink.endpoint(id).num_pending() == 0 {
            debug!(server = %self.sink.endpoint(id).server(), "Resetting keepalive timeout");
            self.wheel.register(
                id,
                Instant::now() + self.config.keepalive_timeout,
                TimeoutKind::Keepalive,
            );
        }
        Ok(())
    }

    fn handle_failure(&mut self, envelope: FailureEnvelope) {
        let endpoint = self.sink.endpoint(envelope.endpoint);
        if endpoint.is_stale(envelope.epoch) {
            debug!(server = %endpoint.server(), "Discarding failure from stale connection");
            return;
        }
        // Workers reconnect on their own after transport failures, so no
        // reconnect request is needed for this path
        self.fail(envelope.endpoint, Some(envelope.epoch), envelope.error, false);
    }

    /// Fail an endpoint from the dispatcher side (timeout, protocol
    /// violation). The worker is still connected and unaware, so it is told
    /// to reconnect.
    fn fail_endpoint(&mut self, id: EndpointId, error: PublishError) {
        self.fail(id, None, error, true);
    }

    /// Common failure path: write the connection off, unlink the endpoint
    /// from every list, and requeue its payloads for redelivery. Payloads
    /// keep their place in the global in-flight queue, so registrar ordering
    /// is unaffected by the failover.
    fn fail(
        &mut self,
        id: EndpointId,
        failed_epoch: Option<u64>,
        error: PublishError,
        request_reconnect: bool,
    ) {
        {
            let endpoint = self.sink.endpoint_mut(id);
            if endpoint.is_failed() {
                // Recovery already in progress; just advance the stale horizon
                debug!(server = %endpoint.server(), "Endpoint failed again while recovering: {error}");
                endpoint.mark_failed(failed_epoch);
                return;
            }
            error!(server = %endpoint.server(), "Endpoint failed: {error}");
            endpoint.mark_failed(failed_epoch);
            endpoint.clear_pinging();
            endpoint.set_ready(false);
            endpoint.set_full(false);
        }

        self.ready.remove(id);
        self.full.remove(id);
        self.wheel.cancel(id);

        let pending = self.sink.endpoint_mut(id).take_pending();
        if !pending.is_empty() {
            warn!(
                server = %self.sink.endpoint(id).server(),
                count = pending.len(),
                "Requeueing payloads from failed endpoint for redelivery"
            );
            self.retry.extend(pending);
        }

        if request_reconnect {
            self.sink.request_reconnect(id);
        }
    }

    /// Drain every timeout whose deadline has passed. The wheel disarms each
    /// entry before its handler runs, so handlers re-arm freely.
    fn process_timeouts(&mut self) {
        let now = Instant::now();
        while let Some((id, kind)) = self.wheel.pop_expired(now) {
            debug!(server = %self.sink.endpoint(id).server(), "Processing timeout");
            match kind {
                TimeoutKind::Pending => {
                    self.stats.incr_timeouts();
                    let error = if self.sink.endpoint(id).is_pinging() {
                        PublishError::NetworkPing
                    } else {
                        PublishError::NetworkTimeout
                    };
                    self.fail_endpoint(id, error);
                }
                TimeoutKind::Keepalive => {
                    debug!(server = %self.sink.endpoint(id).server(), "Sending PING and starting pending timeout");
                    self.wheel
                        .register(id, now + self.config.timeout, TimeoutKind::Pending);
                    let result = self.sink.endpoint_mut(id).send_ping();
                    if let Err(err) = result {
                        self.fail_endpoint(id, err);
                    }
                }
            }
        }
    }

    /// Resume spool intake once capacity allows: nothing parked, below the
    /// in-flight cap, not shutting down.
    fn maybe_reopen_gate(&mut self) {
        if !self.spool_gate_open
            && !self.shutting_down
            && self.next_spool.is_none()
            && self.inflight.len() < self.config.max_pending_payloads
        {
            self.spool_gate_open = true;
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::event::{Cursor, Event};
    use crate::registrar::AckEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Connector that never completes; unit tests drive endpoint state by
    /// hand instead of through workers.
    struct IdleConnector;

    #[async_trait]
    impl Connector for IdleConnector {
        async fn connect(
            &self,
            _server: &str,
            _pool: &AddressPool,
        ) -> Result<crate::endpoint::transport::Connection, TransportError> {
            std::future::pending().await
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    enum RegistrarCall {
        Add(AckEvent),
        Send,
    }

    #[derive(Clone, Default)]
    struct RecordingRegistrar {
        calls: Arc<Mutex<Vec<RegistrarCall>>>,
    }

    impl Registrar for RecordingRegistrar {
        fn add(&mut self, ack: AckEvent) {
            self.calls
                .lock()
                .expect("registrar lock")
                .push(RegistrarCall::Add(ack));
        }

        fn send(&mut self) {
            self.calls
                .lock()
                .expect("registrar lock")
                .push(RegistrarCall::Send);
        }

        fn close(&mut self) {}
    }

    impl RecordingRegistrar {
        fn added(&self) -> Vec<AckEvent> {
            self.calls
                .lock()
                .expect("registrar lock")
                .iter()
                .filter_map(|call| match call {
                    RegistrarCall::Add(ack) => Some(ack.clone()),
                    RegistrarCall::Send => None,
                })
                .collect()
        }

        fn sends(&self) -> usize {
            self.calls
                .lock()
                .expect("registrar lock")
                .iter()
                .filter(|call| matches!(call, RegistrarCall::Send))
                .count()
        }
    }

    fn publisher(servers: &[&str], config: Config) -> (Publisher, RecordingRegistrar) {
        let registrar = RecordingRegistrar::default();
        let config = Config {
            servers: servers.iter().map(ToString::to_string).collect(),
            ..config
        };
        let publisher = Publisher::new(
            config,
            Arc::new(IdleConnector),
            Some(Box::new(registrar.clone())),
        );
        (publisher, registrar)
    }

    fn spool(source: &str, count: usize) -> Spool {
        (0..count)
            .map(|i| Event::new("line", Cursor::new(source, (i as u64 + 1) * 10)))
            .collect()
    }

    fn offer(publisher: &mut Publisher, id: EndpointId) {
        publisher.handle_ready(ReadyEnvelope {
            endpoint: id,
            epoch: 1,
        });
    }

    fn ack(publisher: &mut Publisher, id: EndpointId, seq: u64, upto: usize) {
        publisher.handle_response(ResponseEnvelope {
            endpoint: id,
            epoch: 1,
            response: EndpointResponse::Ack(AckResponse {
                payload_seq: seq,
                sequence: upto,
            }),
        });
    }

    #[tokio::test]
    async fn test_out_of_order_acks_reach_registrar_in_source_order() {
        let (mut publisher, registrar) = publisher(&["e1", "e2"], Config::default());

        offer(&mut publisher, 0);
        offer(&mut publisher, 1);
        publisher.handle_spool(spool("a", 3)); // seq 0 -> e1
        publisher.handle_spool(spool("b", 2)); // seq 1 -> e2
        offer(&mut publisher, 0);
        publisher.handle_spool(spool("c", 1)); // seq 2 -> e1

        // B completes first: nothing for the registrar yet
        ack(&mut publisher, 1, 1, 2);
        assert_eq!(publisher.out_of_sync, 1);
        assert!(registrar.added().is_empty());

        // A completes: A then B drain in one pass
        ack(&mut publisher, 0, 0, 3);
        assert_eq!(publisher.out_of_sync, 0);
        let added = registrar.added();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].cursor.source.as_ref(), "a");
        assert_eq!(added[0].lines, 3);
        assert_eq!(added[1].cursor.source.as_ref(), "b");
        assert_eq!(added[1].lines, 2);
        assert_eq!(publisher.inflight.front().map(PendingPayload::seq), Some(2));

        // C completes last
        ack(&mut publisher, 0, 2, 1);
        assert_eq!(registrar.added().len(), 3);
        assert_eq!(publisher.out_of_sync, 0);
        assert!(publisher.inflight.is_empty());
        assert_eq!(publisher.stats.snapshot().pending_payloads, 0);
        assert_eq!(publisher.stats.snapshot().published_lines, 6);
    }

    #[tokio::test]
    async fn test_partial_ack_rolls_up_head_without_advancing() {
        let (mut publisher, registrar) = publisher(&["e1"], Config::default());

        offer(&mut publisher, 0);
        publisher.handle_spool(spool("a", 10));

        ack(&mut publisher, 0, 0, 4);
        let added = registrar.added();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].lines, 4);
        assert_eq!(added[0].cursor.offset, 40);
        assert_eq!(publisher.inflight.len(), 1);
        assert_eq!(registrar.sends(), 1);

        ack(&mut publisher, 0, 0, 10);
        let added = registrar.added();
        assert_eq!(added.len(), 2);
        assert_eq!(added[1].lines, 6);
        assert_eq!(added[1].cursor.offset, 100);
        assert!(publisher.inflight.is_empty());
        assert_eq!(registrar.sends(), 2);
    }

    #[tokio::test]
    async fn test_full_endpoint_leaves_rotation_and_returns_on_ack() {
        let (mut publisher, _registrar) = publisher(&["e1"], Config::default());

        for i in 0..4 {
            offer(&mut publisher, 0);
            publisher.handle_spool(spool("s", 1));
            assert_eq!(publisher.sink.endpoint(0).num_pending(), i + 1);
        }

        // The endpoint reports ready again but is now at the threshold
        offer(&mut publisher, 0);
        assert!(publisher.sink.endpoint(0).is_full());
        assert!(publisher.full.contains(0));
        assert!(publisher.ready.is_empty());

        // A fifth spool has nowhere to go and parks
        publisher.handle_spool(spool("parked", 1));
        assert!(publisher.next_spool.is_some());
        assert!(!publisher.spool_gate_open);

        // First ack drops pending below the threshold; the parked spool is
        // dispatched immediately
        ack(&mut publisher, 0, 0, 1);
        assert!(!publisher.sink.endpoint(0).is_full());
        assert!(!publisher.full.contains(0));
        assert!(publisher.next_spool.is_none());
        assert!(publisher.spool_gate_open);
        assert_eq!(publisher.sink.endpoint(0).num_pending(), 4);
    }

    #[tokio::test]
    async fn test_empty_spool_rejected_without_state_change() {
        let (mut publisher, registrar) = publisher(&["e1"], Config::default());
        offer(&mut publisher, 0);

        publisher.handle_spool(Vec::new());

        assert!(publisher.inflight.is_empty());
        assert!(!publisher.ready.is_empty());
        assert!(publisher.sink.endpoint(0).is_ready());
        assert!(registrar.added().is_empty());
    }

    #[tokio::test]
    async fn test_pending_cap_closes_and_reopens_gate() {
        let config = Config {
            max_pending_payloads: 2,
            ..Config::default()
        };
        let (mut publisher, _registrar) = publisher(&["e1"], config);

        offer(&mut publisher, 0);
        publisher.handle_spool(spool("a", 1));
        assert!(publisher.spool_gate_open);

        offer(&mut publisher, 0);
        publisher.handle_spool(spool("b", 1));
        assert!(!publisher.spool_gate_open);

        // Completing the head frees capacity
        ack(&mut publisher, 0, 0, 1);
        assert!(publisher.spool_gate_open);
    }

    #[tokio::test]
    async fn test_failed_endpoint_payloads_redeliver_in_order() {
        let (mut publisher, registrar) = publisher(&["e1", "e2"], Config::default());

        offer(&mut publisher, 0);
        publisher.handle_spool(spool("a", 5));
        offer(&mut publisher, 0);
        publisher.handle_spool(spool("b", 2));

        // A partial ack lands before the endpoint dies
        ack(&mut publisher, 0, 0, 2);
        assert_eq!(registrar.added().len(), 1);

        publisher.fail_endpoint(0, PublishError::NetworkTimeout);
        assert_eq!(publisher.sink.endpoint(0).num_pending(), 0);
        assert_eq!(publisher.retry.len(), 2);
        assert!(!publisher.wheel.is_armed(0));
        // Both payloads still hold their place in the global queue
        assert_eq!(publisher.inflight.len(), 2);

        // The second endpoint picks the stranded payloads up in order
        offer(&mut publisher, 1);
        assert_eq!(publisher.sink.endpoint(1).num_pending(), 1);
        offer(&mut publisher, 1);
        assert_eq!(publisher.sink.endpoint(1).num_pending(), 2);
        assert!(publisher.retry.is_empty());

        // The resent suffix of A completes it, then B
        ack(&mut publisher, 1, 0, 3);
        ack(&mut publisher, 1, 1, 2);

        let added = registrar.added();
        assert_eq!(added.len(), 3);
        assert_eq!(added[0].cursor.source.as_ref(), "a");
        assert_eq!(added[0].lines, 2);
        assert_eq!(added[1].cursor.source.as_ref(), "a");
        assert_eq!(added[1].lines, 3);
        assert_eq!(added[2].cursor.source.as_ref(), "b");
        assert!(publisher.inflight.is_empty());
        assert_eq!(publisher.stats.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_stale_envelopes_are_discarded_after_failure() {
        let (mut publisher, _registrar) = publisher(&["e1"], Config::default());

        offer(&mut publisher, 0);
        publisher.handle_spool(spool("a", 1));
        publisher.fail_endpoint(0, PublishError::NetworkTimeout);

        // Acks and failures from the failed connection change nothing
        ack(&mut publisher, 0, 0, 1);
        assert_eq!(publisher.inflight.len(), 1);
        publisher.handle_failure(FailureEnvelope {
            endpoint: 0,
            epoch: 1,
            error: TransportError::Closed.into(),
        });
        assert_eq!(publisher.retry.len(), 1);

        // A newer connection is accepted again
        publisher.handle_ready(ReadyEnvelope {
            endpoint: 0,
            epoch: 2,
        });
        assert!(!publisher.sink.endpoint(0).is_failed());
        // The stranded payload went straight back out
        assert_eq!(publisher.sink.endpoint(0).num_pending(), 1);
    }

    #[tokio::test]
    async fn test_pending_timeout_fails_endpoint() {
        let (mut publisher, _registrar) = publisher(&["e1"], Config::default());

        offer(&mut publisher, 0);
        publisher.handle_spool(spool("a", 1));
        assert!(publisher.wheel.is_armed(0));

        // Force the deadline into the past and fire
        publisher
            .wheel
            .register(0, Instant::now() - Duration::from_millis(1), TimeoutKind::Pending);
        publisher.process_timeouts();

        assert!(publisher.sink.endpoint(0).is_failed());
        assert_eq!(publisher.retry.len(), 1);
        assert_eq!(publisher.stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_keepalive_pings_then_fails_without_pong() {
        let (mut publisher, _registrar) = publisher(&["e1"], Config::default());
        offer(&mut publisher, 0);
        assert!(publisher.wheel.is_armed(0));

        publisher
            .wheel
            .register(0, Instant::now() - Duration::from_millis(1), TimeoutKind::Keepalive);
        publisher.process_timeouts();
        assert!(publisher.sink.endpoint(0).is_pinging());
        assert!(publisher.wheel.is_armed(0));

        // No pong in time: the endpoint fails with the keepalive error
        publisher
            .wheel
            .register(0, Instant::now() - Duration::from_millis(1), TimeoutKind::Pending);
        publisher.process_timeouts();
        assert!(publisher.sink.endpoint(0).is_failed());
    }

    #[tokio::test]
    async fn test_pong_returns_endpoint_to_keepalive() {
        let (mut publisher, _registrar) = publisher(&["e1"], Config::default());
        offer(&mut publisher, 0);

        publisher
            .wheel
            .register(0, Instant::now() - Duration::from_millis(1), TimeoutKind::Keepalive);
        publisher.process_timeouts();
        assert!(publisher.sink.endpoint(0).is_pinging());

        publisher.handle_response(ResponseEnvelope {
            endpoint: 0,
            epoch: 1,
            response: EndpointResponse::Pong,
        });
        assert!(!publisher.sink.endpoint(0).is_pinging());
        assert!(!publisher.sink.endpoint(0).is_failed());
    }

    #[tokio::test]
    async fn test_unexpected_pong_fails_endpoint() {
        let (mut publisher, _registrar) = publisher(&["e1"], Config::default());
        offer(&mut publisher, 0);

        publisher.handle_response(ResponseEnvelope {
            endpoint: 0,
            epoch: 1,
            response: EndpointResponse::Pong,
        });
        assert!(publisher.sink.endpoint(0).is_failed());
    }

    #[tokio::test]
    async fn test_ready_list_prefers_least_loaded_endpoint() {
        let (mut publisher, _registrar) = publisher(&["e1", "e2"], Config::default());

        // e1 carries a payload, e2 is idle
        offer(&mut publisher, 0);
        publisher.handle_spool(spool("a", 1));
        offer(&mut publisher, 0);
        offer(&mut publisher, 1);

        // The next spool goes to the idle endpoint
        publisher.handle_spool(spool("b", 1));
        assert_eq!(publisher.sink.endpoint(1).num_pending(), 1);
        assert_eq!(publisher.sink.endpoint(0).num_pending(), 1);
    }
}
