//! Correlation IDs and timing helpers for batch runs.
//!
//! Every batch gets a `trace_id` that prefixes its log lines and is stamped
//! into every structured observation, so failures stay correlatable across
//! logs and the HTTP response.

use std::time::Instant;

use uuid::Uuid;

/// Generate a random (v4) UUID trace ID for a batch.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Use the caller's trace ID when it is present and non-blank, otherwise mint one.
pub fn resolve_trace_id(requested: Option<&str>) -> String {
    match requested {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => generate_trace_id(),
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Milliseconds elapsed since `start`, with sub-millisecond precision.
pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_v4_uuid(id: &str) -> bool {
        Uuid::parse_str(id).is_ok_and(|u| u.get_version_num() == 4) && id.len() == 36
    }

    #[test]
    fn trace_id_is_a_random_uuid() {
        let id1 = generate_trace_id();
        let id2 = generate_trace_id();
        assert_ne!(id1, id2);
        assert!(is_v4_uuid(&id1), "{id1}");
        assert_eq!(id1, id1.to_lowercase());
    }

    #[test]
    fn resolve_keeps_caller_id() {
        assert_eq!(resolve_trace_id(Some("abc")), "abc");
    }

    #[test]
    fn resolve_mints_for_missing_or_blank() {
        assert!(is_v4_uuid(&resolve_trace_id(None)));
        assert!(is_v4_uuid(&resolve_trace_id(Some("  "))));
    }

    #[test]
    fn timestamp_is_recent() {
        // 2020-01-01 as a sanity floor.
        assert!(unix_timestamp() > 1_577_836_800.0);
    }
}
