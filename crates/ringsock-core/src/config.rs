//! Ring configuration
//!
//! Process-wide tunables for the io_uring engine and socket reads.
//! A live ring keeps the snapshot it was built with; edits made through
//! [`configure`] apply to the next ring epoch (after `cleanup()`).
//!
//! # Example
//!
//! ```rust
//! use ringsock_core::config;
//!
//! // Tune for a busy server, then tweak one field.
//! config::configure_for_server();
//! config::configure(|c| c.queue_retries = 50);
//! assert_eq!(config::current().queue_depth, 4096);
//! config::reset();
//! ```

use std::sync::RwLock;
use std::time::Duration;

pub mod defaults {
    //! Compile-time defaults and preset values.

    use std::time::Duration;

    pub const QUEUE_DEPTH: u32 = 1024;
    pub const QUEUE_RETRIES: u32 = 10;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(1);

    pub const QUEUE_DEPTH_MIN: u32 = 8;
    pub const QUEUE_DEPTH_MAX: u32 = 65536;
    pub const QUEUE_RETRIES_MAX: u32 = 1000;

    pub const CLIENT_QUEUE_DEPTH: u32 = 256;
    pub const CLIENT_QUEUE_RETRIES: u32 = 5;
    pub const CLIENT_READ_BUFFER: usize = 32 * 1024;

    pub const SERVER_QUEUE_DEPTH: u32 = 4096;
    pub const SERVER_QUEUE_RETRIES: u32 = 20;
    pub const SERVER_READ_BUFFER: usize = 128 * 1024;
}

/// Tunables consulted at ring creation and on every `read()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// SQ/CQ entry count, clamped to [8, 65536]
    pub queue_depth: u32,
    /// Attempts when the SQ is full before `QueueFull`, clamped to [0, 1000]
    pub queue_retries: u32,
    /// Linear back-off step between submission retries
    pub retry_base_delay: Duration,
    /// Per-read allocation override; `None` falls back to SO_RCVBUF
    pub read_buffer_size: Option<usize>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: defaults::QUEUE_DEPTH,
            queue_retries: defaults::QUEUE_RETRIES,
            retry_base_delay: defaults::RETRY_BASE_DELAY,
            read_buffer_size: None,
        }
    }
}

impl RingConfig {
    /// Preset for client-heavy processes: small ring, small reads.
    pub fn client() -> Self {
        Self {
            queue_depth: defaults::CLIENT_QUEUE_DEPTH,
            queue_retries: defaults::CLIENT_QUEUE_RETRIES,
            retry_base_delay: defaults::RETRY_BASE_DELAY,
            read_buffer_size: Some(defaults::CLIENT_READ_BUFFER),
        }
    }

    /// Preset for accept-heavy servers: deep ring, large reads.
    pub fn server() -> Self {
        Self {
            queue_depth: defaults::SERVER_QUEUE_DEPTH,
            queue_retries: defaults::SERVER_QUEUE_RETRIES,
            retry_base_delay: defaults::RETRY_BASE_DELAY,
            read_buffer_size: Some(defaults::SERVER_READ_BUFFER),
        }
    }

    /// Clamp fields into their documented ranges.
    pub fn clamped(mut self) -> Self {
        self.queue_depth = self
            .queue_depth
            .clamp(defaults::QUEUE_DEPTH_MIN, defaults::QUEUE_DEPTH_MAX);
        self.queue_retries = self.queue_retries.min(defaults::QUEUE_RETRIES_MAX);
        self
    }
}

static CONFIG: RwLock<Option<RingConfig>> = RwLock::new(None);

/// Snapshot of the current process-wide configuration.
pub fn current() -> RingConfig {
    CONFIG
        .read()
        .expect("config lock poisoned")
        .clone()
        .unwrap_or_default()
}

/// Mutate the process-wide configuration in place.
///
/// Takes effect for rings created after this call; a running ring keeps
/// the snapshot it was initialized with until `cleanup()`.
pub fn configure<F: FnOnce(&mut RingConfig)>(f: F) {
    let mut guard = CONFIG.write().expect("config lock poisoned");
    let mut cfg = guard.clone().unwrap_or_default();
    f(&mut cfg);
    *guard = Some(cfg.clamped());
}

/// Install the client preset wholesale.
pub fn configure_for_client() {
    *CONFIG.write().expect("config lock poisoned") = Some(RingConfig::client());
}

/// Install the server preset wholesale.
pub fn configure_for_server() {
    *CONFIG.write().expect("config lock poisoned") = Some(RingConfig::server());
}

/// Drop any overrides and return to the library defaults.
pub fn reset() {
    *CONFIG.write().expect("config lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    // The store is process-global, so these tests share it; each one
    // restores the default state before returning.

    #[test]
    fn test_defaults() {
        let cfg = RingConfig::default();
        assert_eq!(cfg.queue_depth, 1024);
        assert_eq!(cfg.queue_retries, 10);
        assert_eq!(cfg.retry_base_delay, Duration::from_millis(1));
        assert_eq!(cfg.read_buffer_size, None);
    }

    #[test]
    fn test_presets() {
        let client = RingConfig::client();
        assert_eq!(client.queue_depth, 256);
        assert_eq!(client.queue_retries, 5);
        assert_eq!(client.read_buffer_size, Some(32 * 1024));

        let server = RingConfig::server();
        assert_eq!(server.queue_depth, 4096);
        assert_eq!(server.queue_retries, 20);
        assert_eq!(server.read_buffer_size, Some(128 * 1024));
    }

    #[test]
    fn test_clamping() {
        let cfg = RingConfig {
            queue_depth: 2,
            queue_retries: 100_000,
            ..RingConfig::default()
        }
        .clamped();
        assert_eq!(cfg.queue_depth, 8);
        assert_eq!(cfg.queue_retries, 1000);

        let cfg = RingConfig {
            queue_depth: 1 << 20,
            ..RingConfig::default()
        }
        .clamped();
        assert_eq!(cfg.queue_depth, 65536);
    }

    #[test]
    fn test_configure_then_reset() {
        configure(|c| c.queue_depth = 512);
        assert_eq!(current().queue_depth, 512);

        reset();
        assert_eq!(current(), RingConfig::default());

        // configure(x); reset(); configure(y) yields y, not x|y merged.
        configure(|c| c.queue_retries = 3);
        assert_eq!(current().queue_retries, 3);
        assert_eq!(current().queue_depth, 1024);
        reset();
    }
}
