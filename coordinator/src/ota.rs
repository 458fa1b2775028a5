use crate::errors::Result;
use crate::metrics::{OTA_INVALID_REPORTS_TOTAL, OTA_REPORTS_TOTAL};
use crate::model::OtaStatusRecord;
use crate::validate;
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::debug;

/// A status report as it arrives off the wire, before validation. The
/// device's firmware is the author, so every field beyond the identity
/// pair is treated as untrusted.
#[derive(Debug, Deserialize)]
pub struct RawStatusReport {
    pub device_id: String,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

/// Validates and upserts a device's OTA status. Last write wins: the
/// projection keeps exactly one row per device and no history, so
/// out-of-order delivery can transiently regress the displayed progress.
pub async fn report_status(pool: &PgPool, report: RawStatusReport) -> Result<OtaStatusRecord> {
    if let Err(e) = validate::validate_report(&report.device_id, &report.status) {
        OTA_INVALID_REPORTS_TOTAL.inc();
        return Err(e);
    }

    let progress = validate::clamp_progress(report.progress);
    let reported_at = validate::normalize_timestamp(report.timestamp.as_ref(), Utc::now());

    let record = sqlx::query_as::<_, OtaStatusRecord>(
        "INSERT INTO ota_status \
           (device_id, status, progress, message, firmware_version, reported_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
         ON CONFLICT (device_id) DO UPDATE SET \
           status = EXCLUDED.status, \
           progress = EXCLUDED.progress, \
           message = EXCLUDED.message, \
           firmware_version = EXCLUDED.firmware_version, \
           reported_at = EXCLUDED.reported_at, \
           updated_at = NOW() \
         RETURNING device_id, status, progress, message, firmware_version, reported_at, updated_at",
    )
    .bind(&report.device_id)
    .bind(&report.status)
    .bind(progress)
    .bind(&report.message)
    .bind(&report.firmware_version)
    .bind(reported_at)
    .fetch_one(pool)
    .await?;

    OTA_REPORTS_TOTAL.inc();
    debug!(
        "OTA status for {}: {} at {}%",
        record.device_id, record.status, record.progress
    );

    Ok(record)
}

/// Fetches the current status projection for a device, if any report has
/// ever arrived.
pub async fn latest_status(pool: &PgPool, device_id: &str) -> Result<Option<OtaStatusRecord>> {
    Ok(sqlx::query_as::<_, OtaStatusRecord>(
        "SELECT device_id, status, progress, message, firmware_version, reported_at, updated_at \
         FROM ota_status WHERE device_id = $1",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?)
}
