//! # ringsock-core — shared types for the ringsock stack
//!
//! Platform-agnostic pieces used by both the io_uring engine and the
//! socket surface:
//!
//! - [`error`] — the socket error taxonomy and errno mapping
//! - [`config`] — the process-wide ring configuration record

pub mod config;
pub mod error;

pub use config::RingConfig;
pub use error::{SockError, SockResult};
