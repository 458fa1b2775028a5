use crate::metrics::OTA_ACTIVE_WATCHERS;
use crate::model::OtaStatusRecord;
use crate::ota;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

pub const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Turns the latest-wins status projection into a per-device change
/// stream. Each watch is its own task holding its own device id; there
/// is no shared subscription registry. Dropping the receiver tears the
/// task down on its next emit.
pub fn watch_status(
    pool: PgPool,
    device_id: String,
    poll_interval: Duration,
) -> (JoinHandle<()>, mpsc::Receiver<OtaStatusRecord>) {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        OTA_ACTIVE_WATCHERS.inc();
        debug!("Watching OTA status for device {}", device_id);

        let mut previous: Option<OtaStatusRecord> = None;
        let mut ticker = interval(poll_interval);

        loop {
            ticker.tick().await;

            let current = match ota::latest_status(&pool, &device_id).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Status poll failed for {}: {}", device_id, e);
                    continue;
                }
            };

            let Some(current) = current else { continue };

            if is_new_report(previous.as_ref(), &current) {
                if tx.send(current.clone()).await.is_err() {
                    debug!("Watch for {} dropped, stopping", device_id);
                    break;
                }
                previous = Some(current);
            }
        }

        OTA_ACTIVE_WATCHERS.dec();
    });

    (handle, rx)
}

/// A report is new when nothing has been seen yet or the stored row
/// advanced since the last emit.
pub fn is_new_report(previous: Option<&OtaStatusRecord>, current: &OtaStatusRecord) -> bool {
    match previous {
        None => true,
        Some(prev) => {
            prev.updated_at != current.updated_at
                || prev.status != current.status
                || prev.progress != current.progress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(status: &str, progress: i32, updated_secs: i64) -> OtaStatusRecord {
        OtaStatusRecord {
            device_id: "dev-1".to_string(),
            status: status.to_string(),
            progress,
            message: None,
            firmware_version: None,
            reported_at: Utc.timestamp_opt(updated_secs, 0).unwrap(),
            updated_at: Utc.timestamp_opt(updated_secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_report_is_new() {
        assert!(is_new_report(None, &record("starting", 0, 100)));
    }

    #[test]
    fn test_identical_row_is_not_new() {
        let prev = record("downloading", 40, 100);
        assert!(!is_new_report(Some(&prev), &record("downloading", 40, 100)));
    }

    #[test]
    fn test_advanced_row_is_new() {
        let prev = record("downloading", 40, 100);
        assert!(is_new_report(Some(&prev), &record("downloading", 60, 100)));
        assert!(is_new_report(Some(&prev), &record("installing", 40, 100)));
        assert!(is_new_report(Some(&prev), &record("downloading", 40, 101)));
    }
}
