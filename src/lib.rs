//! # logship-publisher
//!
//! Publisher core of a log-shipping agent. It accepts batches of log events
//! (spools) from an upstream spooler, distributes them across a fleet of
//! remote log collectors, tracks per-batch acknowledgments, and feeds
//! acknowledgments to a downstream registrar in **strict source order** so a
//! single monotonic resumption cursor can be persisted.
//!
//! ## Overview
//!
//! - [`publisher`]: the single-task dispatcher — endpoint selection, the
//!   ordered acknowledgment drain, timeout handling, and graceful shutdown
//! - [`endpoint`]: per-remote state machines, transport workers, and the
//!   sink that multiplexes their output toward the dispatcher
//! - [`payload`]: in-flight batch tracking with acknowledgment watermarks
//!   and registrar rollups
//! - [`registrar`]: the checkpoint sink contract (a null implementation is
//!   used when none is configured)
//! - [`config`], [`error`], [`event`], [`stats`]: configuration, the error
//!   taxonomy, event/spool types, and thread-safe statistics
//!
//! ## Delivery semantics
//!
//! At-least-once: when an endpoint fails, its outstanding payloads are
//! retransmitted on the remaining fleet and the remote may observe
//! duplicates. The registrar never does — it only ever sees the contiguous
//! acknowledged prefix of the dispatch order, each payload exactly once per
//! acknowledged extent.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use logship_publisher::{Config, Publisher};
//!
//! let config = Config {
//!     servers: vec!["logs1.example.com:5043".into()],
//!     ..Config::default()
//! };
//! let publisher = Publisher::new(config, Arc::new(transport), Some(registrar));
//! let spool_tx = publisher.connect();
//! let handle = publisher.handle();
//! tokio::spawn(publisher.run());
//!
//! // feed spools through spool_tx; on shutdown:
//! handle.shutdown();
//! handle.wait_done().await;
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod payload;
pub mod publisher;
pub mod registrar;
pub mod stats;

pub use config::Config;
pub use error::{PublishError, TransportError};
pub use event::{Cursor, Event, Spool};
pub use publisher::{Publisher, PublisherHandle};
pub use registrar::{AckEvent, NullRegistrar, Registrar};
pub use stats::Snapshot;
