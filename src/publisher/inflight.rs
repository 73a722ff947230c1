//! The global in-flight queue: every payload in dispatch order.
//!
//! Payloads enter at the back when dispatched and leave at the front once the
//! ordered drain walks past them. Nothing is ever removed from the middle, so
//! the queue stays contiguous by sequence and lookup is plain arithmetic.

use std::collections::VecDeque;

use crate::error::PublishError;
use crate::event::Spool;
use crate::payload::PendingPayload;

#[derive(Debug, Default)]
pub(crate) struct InflightQueue {
    queue: VecDeque<PendingPayload>,
    next_seq: u64,
}

impl InflightQueue {
    pub(crate) fn new() -> Self {
        InflightQueue::default()
    }

    /// Append a spool as a new payload, assigning the next source-order
    /// sequence. Fails on an empty spool without consuming a sequence.
    pub(crate) fn push(&mut self, events: Spool) -> Result<&PendingPayload, PublishError> {
        let payload = PendingPayload::new(self.next_seq, events)?;
        self.next_seq += 1;
        self.queue.push_back(payload);
        Ok(self.queue.back().expect("payload was just appended"))
    }

    pub(crate) fn get_mut(&mut self, seq: u64) -> Option<&mut PendingPayload> {
        let front_seq = self.queue.front()?.seq();
        let index = seq.checked_sub(front_seq)?;
        self.queue.get_mut(index as usize)
    }

    pub(crate) fn front(&self) -> Option<&PendingPayload> {
        self.queue.front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut PendingPayload> {
        self.queue.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<PendingPayload> {
        self.queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
