//! Timeout wheel: one armed deadline per endpoint, one underlying timer.
//!
//! Entries are ordered by due time; the dispatcher arms its single sleep to
//! the head and drains every entry that has come due when it fires. An
//! endpoint re-registering replaces its existing entry.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use crate::endpoint::EndpointId;

/// What to do when an endpoint's deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    /// Outstanding payloads were not acknowledged in time; fail the
    /// endpoint.
    Pending,
    /// The endpoint has been idle; send a keepalive ping.
    Keepalive,
}

#[derive(Debug, Default)]
pub(crate) struct TimeoutWheel {
    // (due, endpoint) keys are unique: an endpoint holds at most one entry
    ordered: BTreeMap<(Instant, EndpointId), TimeoutKind>,
    armed: HashMap<EndpointId, Instant>,
}

impl TimeoutWheel {
    pub(crate) fn new() -> Self {
        TimeoutWheel::default()
    }

    /// Arm (or re-arm) the endpoint's deadline.
    pub(crate) fn register(&mut self, id: EndpointId, due: Instant, kind: TimeoutKind) {
        if let Some(previous) = self.armed.insert(id, due) {
            self.ordered.remove(&(previous, id));
        }
        self.ordered.insert((due, id), kind);
    }

    /// Disarm the endpoint's deadline, if any.
    pub(crate) fn cancel(&mut self, id: EndpointId) {
        if let Some(due) = self.armed.remove(&id) {
            self.ordered.remove(&(due, id));
        }
    }

    pub(crate) fn is_armed(&self, id: EndpointId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Due time of the head entry; what the dispatcher's timer is armed to.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.ordered.keys().next().map(|&(due, _)| due)
    }

    /// Pop the head if its deadline is not in the future. The entry is
    /// disarmed before the caller dispatches it, so the handler is free to
    /// re-register.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(EndpointId, TimeoutKind)> {
        let (&(due, id), &kind) = self.ordered.iter().next()?;
        if due > now {
            return None;
        }
        self.ordered.remove(&(due, id));
        self.armed.remove(&id);
        Some((id, kind))
    }
}
