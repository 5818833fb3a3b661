//! ID generation utilities for Spinq
//!
//! Provides functions for generating unique identifiers for requests and
//! scheduler workers, plus the timestamp helpers used throughout the crate.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Get today's date (UTC) as a `YYYY-MM-DD` string.
///
/// Used for daily request counter rollover.
pub fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Generate a unique request ID
///
/// Format: `req-{timestamp_ms}-{random_hex}`
/// Example: `req-1738300800123-a1b2`
pub fn generate_request_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("req-{}-{:04x}", timestamp, random)
}

/// Generate a scheduler worker ID
///
/// Format: `worker-{pid}-{random_hex}`
pub fn generate_worker_id() -> String {
    let random: u16 = rand::rng().random();
    format!("worker-{}-{:04x}", std::process::id(), random)
}
