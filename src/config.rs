//! Publisher configuration.
//!
//! The embedding agent deserializes its network section and hands the struct
//! in; this crate performs no file or environment parsing of its own.

use std::time::Duration;

use serde::Deserialize;

/// Network timeout applied to each in-flight payload when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle interval after which an endpoint is pinged.
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(900);

/// Pending payload count at which an endpoint stops receiving new spools.
const DEFAULT_FULL_THRESHOLD: usize = 4;

/// Total in-flight payload count at which the spool gate closes.
const DEFAULT_MAX_PENDING_PAYLOADS: usize = 10;

/// Configuration for the publisher and its endpoint fleet.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote collector identifiers, one endpoint each. Resolution of an
    /// identifier to addresses is the address pool's concern.
    pub servers: Vec<String>,

    /// How long an endpoint may hold outstanding payloads without
    /// acknowledging before it is failed.
    pub timeout: Duration,

    /// How long an endpoint may sit idle before a keepalive ping is sent.
    pub keepalive_timeout: Duration,

    /// Pending payloads at which an endpoint is considered full and leaves
    /// the dispatch rotation until acknowledgments drain it.
    pub full_threshold: usize,

    /// Upper bound on payloads in flight across the whole fleet; reaching it
    /// closes the spool gate until acknowledgments complete payloads.
    pub max_pending_payloads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            servers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            full_threshold: DEFAULT_FULL_THRESHOLD,
            max_pending_payloads: DEFAULT_MAX_PENDING_PAYLOADS,
        }
    }
}
