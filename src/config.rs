//! Server configuration.
//!
//! Plain struct with defaults; `from_env()` applies `SWILL_`-prefixed
//! overrides with JSON-parsed values:
//!
//! ```text
//! SWILL_INBOUND_QUEUE_CAPACITY=128
//! SWILL_INTROSPECTION=false
//! ```

use std::time::Duration;

/// Default capacity of each request's inbound message queue.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 64;

/// Default capacity of the per-connection outbound channel.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Default best-effort flush window during connection teardown.
pub const DEFAULT_CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Server tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of each request's inbound message queue. Feeding a full
    /// queue suspends the dispatcher, which backpressures the transport.
    pub inbound_queue_capacity: usize,
    /// Capacity of the per-connection outbound channel. Handlers writing to
    /// a full channel are suspended.
    pub outbound_queue_capacity: usize,
    /// How long teardown waits for pending outbound frames before
    /// abandoning them.
    pub close_flush_timeout: Duration,
    /// Whether to register the `swill.introspect` procedure.
    pub introspection: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            close_flush_timeout: DEFAULT_CLOSE_FLUSH_TIMEOUT,
            introspection: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `SWILL_`-prefixed environment variables.
    ///
    /// Values are parsed as JSON; unparseable values are ignored with a
    /// warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_u64("SWILL_INBOUND_QUEUE_CAPACITY") {
            config.inbound_queue_capacity = value as usize;
        }
        if let Some(value) = env_u64("SWILL_OUTBOUND_QUEUE_CAPACITY") {
            config.outbound_queue_capacity = value as usize;
        }
        if let Some(value) = env_u64("SWILL_CLOSE_FLUSH_TIMEOUT_MS") {
            config.close_flush_timeout = Duration::from_millis(value);
        }
        if let Some(value) = env_bool("SWILL_INTROSPECTION") {
            config.introspection = value;
        }

        config
    }
}

fn env_json(name: &str) -> Option<serde_json::Value> {
    let raw = std::env::var(name).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(name, error = %e, "ignoring unparseable config override");
            None
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env_json(name)?.as_u64()
}

fn env_bool(name: &str) -> Option<bool> {
    env_json(name)?.as_bool()
}
