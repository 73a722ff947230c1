//! Event and spool types flowing from the upstream spooler.
//!
//! The publisher never inspects event payloads: it counts events and forwards
//! their resumption cursors to the registrar once they are acknowledged.

use std::sync::Arc;

use bytes::Bytes;

/// Resumption position of a single event within its source stream.
///
/// Persisted by the registrar so that shipping can resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Identifier of the source stream the event was read from.
    pub source: Arc<str>,
    /// Byte offset just past the event within the source stream.
    pub offset: u64,
}

impl Cursor {
    #[must_use]
    pub fn new(source: impl Into<Arc<str>>, offset: u64) -> Self {
        Cursor {
            source: source.into(),
            offset,
        }
    }
}

/// One log event: an encoded line plus the cursor that covers it.
///
/// The line bytes are opaque to the publisher; only the transport ever reads
/// them.
#[derive(Debug, Clone)]
pub struct Event {
    /// Encoded event payload, produced upstream.
    pub line: Bytes,
    /// Resumption cursor covering this event.
    pub cursor: Cursor,
}

impl Event {
    #[must_use]
    pub fn new(line: impl Into<Bytes>, cursor: Cursor) -> Self {
        Event {
            line: line.into(),
            cursor,
        }
    }
}

/// A batch of events delivered atomically from the spooler.
///
/// Spools must be non-empty; an empty spool is rejected at payload
/// construction and dropped.
pub type Spool = Vec<Event>;
