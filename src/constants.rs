//! Application-wide constants.
//!
//! Centralizes magic numbers so the job manager, transport, and push
//! dispatcher don't each hardcode their own timing.

use std::time::Duration;

/// No-output watchdog for a freshly spawned agent subprocess (§4.6).
/// If no bytes arrive on stdout/stderr within this window, the job is
/// force-killed and terminates with an error.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL when terminating an agent
/// subprocess, on cancel or on watchdog fire.
pub const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Consecutive failed `auth` attempts on one connection before it is closed
/// (§4.3: "client may retry N times; after N attempts the connection is
/// closed").
pub const MAX_AUTH_ATTEMPTS: u32 = 5;

/// HTTP client request timeout for push-notification delivery.
pub const PUSH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lead-in words that force a new chunk boundary when a text delta
/// (trimmed) starts with one, case-insensitive (§4.6).
pub const CHUNK_LEAD_INS: &[&str] = &["now", "next", "let me", "i'll", "first", "finally", "done"];

/// Per-job bounded channel capacity for fanning deltas out to one
/// subscriber connection. Slow consumers drop the oldest delta rather than
/// block the job coordinator; the authoritative buffer used for replay is
/// unaffected.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;
