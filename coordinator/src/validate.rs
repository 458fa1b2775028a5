use crate::errors::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

pub const VALID_STATUSES: [&str; 7] = [
    "starting",
    "downloading",
    "installing",
    "complete",
    "failed",
    "no_update",
    "heartbeat",
];

// Epoch values below this are treated as seconds, above as milliseconds.
const EPOCH_MS_THRESHOLD: i64 = 10_000_000_000;

/// Validates an incoming OTA status report. Out-of-enum statuses are
/// rejected, never coerced.
pub fn validate_report(device_id: &str, status: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(Error::Validation("device_id cannot be empty".to_string()));
    }

    if !VALID_STATUSES.contains(&status) {
        return Err(Error::Validation(format!(
            "Invalid status value: {}",
            status
        )));
    }

    Ok(())
}

/// Clamps a reported progress value to [0, 100]. Absent or non-finite
/// values count as 0.
pub fn clamp_progress(progress: Option<f64>) -> i32 {
    let p = progress.unwrap_or(0.0);
    if !p.is_finite() {
        return 0;
    }
    p.clamp(0.0, 100.0).round() as i32
}

/// Normalizes a device-supplied timestamp. Accepts a numeric epoch in
/// seconds or milliseconds (also as a digit string) or an RFC 3339
/// string; anything unparseable falls back to the receipt time.
pub fn normalize_timestamp(raw: Option<&Value>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return received_at;
    };

    match raw {
        Value::Number(n) => n.as_i64().and_then(from_epoch).unwrap_or(received_at),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .and_then(from_epoch)
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .unwrap_or(received_at),
        _ => received_at,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    let ms = if raw < EPOCH_MS_THRESHOLD {
        raw.checked_mul(1000)?
    } else {
        raw
    };
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_statuses_accepted() {
        for status in VALID_STATUSES {
            assert!(validate_report("dev-1", status).is_ok());
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(validate_report("dev-1", "rebooting").is_err());
        assert!(validate_report("dev-1", "").is_err());
        assert!(validate_report("dev-1", "COMPLETE").is_err());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        assert!(validate_report("", "starting").is_err());
    }

    #[test]
    fn test_progress_clamped() {
        assert_eq!(clamp_progress(None), 0);
        assert_eq!(clamp_progress(Some(-5.0)), 0);
        assert_eq!(clamp_progress(Some(42.6)), 43);
        assert_eq!(clamp_progress(Some(150.0)), 100);
        assert_eq!(clamp_progress(Some(f64::NAN)), 0);
    }

    #[test]
    fn test_timestamp_epoch_seconds() {
        let fallback = Utc::now();
        let ts = normalize_timestamp(Some(&json!(1_723_032_000)), fallback);
        assert_eq!(ts.timestamp(), 1_723_032_000);
    }

    #[test]
    fn test_timestamp_epoch_milliseconds() {
        let fallback = Utc::now();
        let ts = normalize_timestamp(Some(&json!(1_723_032_000_000_i64)), fallback);
        assert_eq!(ts.timestamp(), 1_723_032_000);
    }

    #[test]
    fn test_timestamp_digit_string() {
        let fallback = Utc::now();
        let ts = normalize_timestamp(Some(&json!("1723032000")), fallback);
        assert_eq!(ts.timestamp(), 1_723_032_000);
    }

    #[test]
    fn test_timestamp_rfc3339_string() {
        let fallback = Utc::now();
        let ts = normalize_timestamp(Some(&json!("2024-08-07T12:00:00Z")), fallback);
        assert_eq!(ts.to_rfc3339(), "2024-08-07T12:00:00+00:00");
    }

    #[test]
    fn test_timestamp_garbage_falls_back() {
        let fallback = Utc::now();
        assert_eq!(normalize_timestamp(Some(&json!("soon")), fallback), fallback);
        assert_eq!(normalize_timestamp(Some(&json!(true)), fallback), fallback);
        assert_eq!(normalize_timestamp(None, fallback), fallback);
    }
}
