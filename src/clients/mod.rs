//! HTTP clients for the record store and the generative providers.

pub mod airtable;
pub mod openrouter;
pub mod replicate;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;

/// Parses a `Retry-After` header given in seconds.
///
/// Negative or out-of-range values are treated as absent.
#[must_use]
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Reads a `retry_after` / `retryAfter` hint (seconds) from an error body.
#[must_use]
pub fn retry_after_from_body(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    let hint = value
        .get("retry_after")
        .or_else(|| value.get("retryAfter"))
        .or_else(|| value.get("error").and_then(|e| e.get("retry_after")))?;

    let secs = match hint {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };

    Duration::try_from_secs_f64(secs).ok()
}
