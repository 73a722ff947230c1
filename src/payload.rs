//! In-flight payload tracking.
//!
//! A [`PendingPayload`] is a spool that has been placed in flight: it retains
//! the original events for possible retransmission, tracks the acknowledgment
//! watermark reported by the remote, and rolls newly-acknowledged events up
//! into registrar checkpoints.

use crate::error::PublishError;
use crate::event::{Event, Spool};
use crate::registrar::AckEvent;

/// One spool in flight, with its acknowledgment state.
///
/// Acknowledgments are cumulative: the remote names the number of leading
/// events it has persisted. The watermark never regresses; a repeat of the
/// current watermark is a no-op, anything lower is a protocol violation.
#[derive(Debug)]
pub struct PendingPayload {
    seq: u64,
    events: Vec<Event>,
    ack_count: usize,
    rollup_mark: usize,
    resend_base: usize,
}

impl PendingPayload {
    /// Wrap a spool for dispatch. Fails on an empty spool, which the caller
    /// drops with a warning; it is never fatal.
    pub(crate) fn new(seq: u64, events: Spool) -> Result<Self, PublishError> {
        if events.is_empty() {
            return Err(PublishError::PayloadInvalid);
        }
        Ok(PendingPayload {
            seq,
            events,
            ack_count: 0,
            rollup_mark: 0,
            resend_base: 0,
        })
    }

    /// Source-order sequence assigned at dispatch.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// True once at least one event has been acknowledged.
    #[must_use]
    pub fn has_ack(&self) -> bool {
        self.ack_count > 0
    }

    /// True once every event has been acknowledged.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.ack_count == self.events.len()
    }

    /// Apply a cumulative acknowledgment up to `sequence` events.
    ///
    /// Returns whether this was the payload's first acknowledgment. A
    /// sequence equal to the current watermark (or zero) is a no-op; a lower
    /// or out-of-range sequence is a protocol violation.
    pub(crate) fn ack(&mut self, sequence: usize) -> Result<bool, PublishError> {
        if sequence > self.events.len() {
            return Err(PublishError::Protocol(format!(
                "Acknowledgment for {} events exceeds payload length {}",
                sequence,
                self.events.len()
            )));
        }
        if sequence < self.ack_count {
            return Err(PublishError::Protocol(format!(
                "Acknowledgment regressed from {} to {}",
                self.ack_count, sequence
            )));
        }

        let first_ack = self.ack_count == 0 && sequence > 0;
        self.ack_count = sequence;
        Ok(first_ack)
    }

    /// Apply an acknowledgment expressed in the current transmission's wire
    /// sequence space. After a retransmission the wire restarts at zero for
    /// the unacked suffix, so the stored base shifts it back onto the
    /// payload's own watermark.
    pub(crate) fn ack_from_wire(&mut self, sequence: usize) -> Result<bool, PublishError> {
        if sequence == 0 {
            return Ok(false);
        }
        self.ack(self.resend_base + sequence)
    }

    /// Roll up everything acknowledged since the previous call.
    ///
    /// Returns `None` when no new events were acknowledged, so repeated calls
    /// are idempotent.
    pub(crate) fn rollup(&mut self) -> Option<AckEvent> {
        if self.ack_count == self.rollup_mark {
            return None;
        }
        let lines = self.ack_count - self.rollup_mark;
        self.rollup_mark = self.ack_count;
        Some(AckEvent {
            cursor: self.events[self.ack_count - 1].cursor.clone(),
            lines,
        })
    }

    /// Prepare the payload for retransmission after an endpoint failure:
    /// capture the watermark as the new wire base and hand back the unacked
    /// suffix to put on the wire.
    pub(crate) fn mark_resend(&mut self) -> &[Event] {
        self.resend_base = self.ack_count;
        &self.events[self.resend_base..]
    }

    /// Events to transmit: the whole spool on first dispatch, the unacked
    /// suffix after a resend.
    pub(crate) fn wire_events(&self) -> &[Event] {
        &self.events[self.resend_base..]
    }
}
