//! Plain, in-process configuration structs. No file or CLI loader lives
//! here — that's an explicitly external concern — but the engine still
//! needs typed, defaultable knobs the way the teacher's `ParameterSettings`
//! is a plain struct with a `Default` impl rather than a builder.

use std::time::Duration;

/// Listener bind/accept settings (spec.md §6 "Listener socket").
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Empty means bind all interfaces (`0.0.0.0`).
    pub bind_address: String,
    pub port: u16,
    pub backlog: u32,
    /// How long the accept loop may go without observing a connection
    /// before re-checking whether it should keep listening.
    pub accept_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            port: 0,
            backlog: 50,
            accept_timeout: Duration::from_secs(5),
        }
    }
}

/// Output queue limits (spec.md §4.8). `max_count`/`max_bytes` of zero mean
/// unlimited, matching the source's zero-sentinel convention.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_count: usize,
    pub max_bytes: u64,
    pub grace_period: Duration,
    pub warning_interval: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_count: 0,
            max_bytes: 0,
            grace_period: Duration::ZERO,
            warning_interval: Duration::from_secs(60),
        }
    }
}

/// Standby-queue limits for sessions that are accepted but not yet online
/// (spec.md §3 "Session", §4.9).
#[derive(Debug, Clone)]
pub struct StandbyLimits {
    pub max_queue_bytes: u64,
    pub time_limit: Duration,
}

impl Default for StandbyLimits {
    fn default() -> Self {
        Self {
            max_queue_bytes: 0,
            time_limit: Duration::ZERO,
        }
    }
}

/// Client connect-strategy settings (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub per_address_timeout: Duration,
    pub overall_deadline: Duration,
    /// Maximum concurrent in-flight connect attempts for
    /// [`crate::connect::ConnectStrategy::Parallel`].
    pub k: usize,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            per_address_timeout: Duration::from_secs(5),
            overall_deadline: Duration::from_secs(10),
            k: 4,
        }
    }
}
