//! # OffKit Common
//!
//! Shared utilities and logging configuration for the OffKit offline cache
//! worker.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Wall-clock helpers for cache entry timestamps

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Milliseconds since the Unix epoch.
///
/// A clock set before the epoch yields 0 rather than panicking.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_nonzero() {
        assert!(now_millis() > 0);
    }

    #[test]
    fn test_now_millis_does_not_go_backwards() {
        let earlier = now_millis();
        let later = now_millis();
        assert!(later >= earlier);
    }
}
