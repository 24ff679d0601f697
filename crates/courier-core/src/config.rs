//! Centralized configuration for the Courier core.
//!
//! Constants for the connection fabric, relay timeouts, pipeline sizing,
//! and admission windows. Binaries override the tunable ones via CLI flags;
//! everything else is fixed here.

use std::time::Duration;

/// Connection fabric configuration.
pub struct FabricConfig;

impl FabricConfig {
    /// Maximum envelope frame size (16 MB). Oversize frames indicate a
    /// corrupt or hostile peer and drop the connection.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Timeout for establishing a connection to a backend service.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Outbound envelope queue depth per connection.
    pub const WRITE_QUEUE_DEPTH: usize = 1024;
}

/// Relay call configuration.
pub struct RelayConfig;

impl RelayConfig {
    /// Default bounded-wait timeout when a route does not specify one.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Shortest per-action timeout routes may configure.
    pub const MIN_TIMEOUT: Duration = Duration::from_secs(3);

    /// Longest per-action timeout routes may configure (long-running
    /// report/AIGC style operations).
    pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);
}

/// Task execution pipeline configuration.
pub struct PipelineConfig;

impl PipelineConfig {
    /// Slots retained in the free pool; beyond this, released slots are
    /// dropped instead of pooled.
    pub const MAX_POOLED_SLOTS: usize = 256;
}

/// Admission (cooldown) configuration.
pub struct CooldownConfig;

impl CooldownConfig {
    /// Default cooling window for routes that enable admission control
    /// without a specific window.
    pub const DEFAULT_COOLING: Duration = Duration::from_millis(500);
}

/// Binary stream listener configuration.
pub struct StreamConfig;

impl StreamConfig {
    /// Two-byte field separator inside a stream frame.
    pub const SEPARATOR: [u8; 2] = [0x10, 0x17];

    /// Maximum stream frame size (64 MB; media chunks are large).
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
}
