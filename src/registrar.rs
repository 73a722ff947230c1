//! Downstream registrar contract.
//!
//! The registrar persists resumption checkpoints. The publisher only ever
//! hands it acknowledgment rollups in source order: `add` accumulates, `send`
//! flushes, `close` is called once at shutdown.

use crate::event::Cursor;

/// A registrar-ready summary of newly-acknowledged events within one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    /// Cursor of the highest-index event covered by this rollup.
    pub cursor: Cursor,
    /// Number of events newly acknowledged since the previous rollup.
    pub lines: usize,
}

/// Checkpoint sink fed by the publisher's ordered acknowledgment drain.
pub trait Registrar: Send {
    /// Accumulate one rollup. Rollups arrive in strict source order.
    fn add(&mut self, ack: AckEvent);

    /// Flush everything accumulated since the previous send.
    fn send(&mut self);

    /// Final flush; no calls follow.
    fn close(&mut self);
}

/// Registrar used when no checkpoint persistence is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistrar;

impl Registrar for NullRegistrar {
    fn add(&mut self, _ack: AckEvent) {}

    fn send(&mut self) {}

    fn close(&mut self) {}
}
