//! Tunable operational defaults for the flock daemon.
//!
//! Protocol-level constants (wire layouts, limits, magic values) live in
//! [`crate::constants`]. This module centralizes configurable defaults
//! that can be overridden via CLI flags.

// ─── Cluster Driver Tuning ──────────────────────────────────────────────────

/// Channel buffer size reserved per member on the in-process bus driver.
pub const DEFAULT_BUS_EVENT_CHANNEL_SIZE: usize = 256;

/// Timeout for the majority-check TCP probe (milliseconds).
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;

// ─── Serializer Tuning ──────────────────────────────────────────────────────

/// Maximum size of a decoded cluster broadcast (bytes). 8 MB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

// ─── VDI ────────────────────────────────────────────────────────────────────

/// Maximum hash collision retries when finding a free VDI ID.
pub const DEFAULT_MAX_VDI_HASH_RETRIES: u32 = 1024;
