//! Scheduler constants for connectivity probing.

/// Default reachability probe cadence in seconds.
pub const CONNECTIVITY_PROBE_INTERVAL_SECS: u64 = 15;

/// Maximum jitter (milliseconds) added to each probe interval.
pub const CONNECTIVITY_PROBE_JITTER_MS: u64 = 1_000;
