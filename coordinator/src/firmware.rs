use crate::errors::{Error, Result};
use crate::metrics::{FIRMWARE_UPDATE_CHECKS_TOTAL, FIRMWARE_UPLOADS_TOTAL};
use crate::model::{FirmwareArtifact, UpdateCheck, UploadReceipt};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SIGNED_URL_TTL_SECS: i64 = 3600;

/// Versioned firmware blobs, one retained artifact per device. Binaries
/// live on the local filesystem; the index rows and signed-URL tokens
/// live in the shared store so any coordinator replica can serve them.
#[derive(Debug, Clone)]
pub struct FirmwareStore {
    pool: PgPool,
    data_dir: PathBuf,
    base_url: String,
}

impl FirmwareStore {
    pub fn new(pool: PgPool, data_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            pool,
            data_dir: data_dir.into(),
            base_url: base_url.into(),
        }
    }

    /// Version tags are wall-clock timestamps, not content hashes:
    /// re-uploading identical bytes still mints a new version and forces
    /// a redownload.
    pub fn version_tag(now: DateTime<Utc>) -> String {
        now.format("%Y%m%d%H%M%S").to_string()
    }

    /// Stores a new firmware binary for a device, superseding whatever
    /// was there. Prior blobs are removed before the new one is written
    /// so a poller is never served a stale download.
    pub async fn upload(
        &self,
        device_id: &str,
        original_filename: &str,
        bytes: &[u8],
    ) -> Result<UploadReceipt> {
        if device_id.is_empty() {
            return Err(Error::Validation("device_id cannot be empty".to_string()));
        }
        if !safe_filename(original_filename) {
            return Err(Error::Validation(format!(
                "Invalid firmware filename: {}",
                original_filename
            )));
        }
        if !original_filename.ends_with(".bin") {
            return Err(Error::Validation(format!(
                "Expected a .bin firmware file, got: {}",
                original_filename
            )));
        }
        if bytes.is_empty() {
            return Err(Error::Validation("Empty firmware upload".to_string()));
        }

        let version = Self::version_tag(Utc::now());
        let filename = format!("{}_{}", version, original_filename);
        let device_dir = self.device_dir(device_id);

        self.remove_existing(device_id, &device_dir).await?;

        fs::create_dir_all(&device_dir).await?;
        fs::write(device_dir.join(&filename), bytes).await?;

        let storage_path = format!("firmware/{}/{}", device_id, filename);
        sqlx::query(
            "INSERT INTO firmware_artifacts \
               (device_id, version, filename, storage_path, size_bytes, uploaded_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (device_id) DO UPDATE SET \
               version = EXCLUDED.version, \
               filename = EXCLUDED.filename, \
               storage_path = EXCLUDED.storage_path, \
               size_bytes = EXCLUDED.size_bytes, \
               uploaded_at = EXCLUDED.uploaded_at",
        )
        .bind(device_id)
        .bind(&version)
        .bind(&filename)
        .bind(&storage_path)
        .bind(bytes.len() as i64)
        .execute(&self.pool)
        .await?;

        FIRMWARE_UPLOADS_TOTAL.inc();
        info!(
            "Stored firmware {} for device {} ({} bytes)",
            version,
            device_id,
            bytes.len()
        );

        let firmware_url = self
            .signed_or_public_url(device_id, &storage_path, &filename)
            .await;

        Ok(UploadReceipt {
            success: true,
            version,
            firmware_url,
        })
    }

    /// Answers the device's update-negotiation poll. Version comparison
    /// is plain string equality: a device reporting any version other
    /// than the stored tag is offered the stored artifact.
    pub async fn check_for_update(
        &self,
        device_id: &str,
        current_version: Option<&str>,
    ) -> Result<UpdateCheck> {
        FIRMWARE_UPDATE_CHECKS_TOTAL.inc();

        let artifact = sqlx::query_as::<_, FirmwareArtifact>(
            "SELECT device_id, version, filename, storage_path, size_bytes, uploaded_at \
             FROM firmware_artifacts WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(artifact) = artifact else {
            debug!("No firmware stored for device {}", device_id);
            return Ok(UpdateCheck::none("No firmware updates available"));
        };

        if is_up_to_date(current_version, &artifact.version) {
            debug!(
                "Device {} already on firmware {}",
                device_id, artifact.version
            );
            return Ok(UpdateCheck::none(
                "Device already has the latest firmware version",
            ));
        }

        let url = self
            .signed_or_public_url(device_id, &artifact.storage_path, &artifact.filename)
            .await;
        info!(
            "Firmware update available for {}: {} (version {})",
            device_id, artifact.filename, artifact.version
        );

        Ok(UpdateCheck {
            has_update: true,
            firmware_url: Some(url),
            filename: Some(artifact.filename),
            firmware_version: Some(artifact.version),
            file_size: Some(artifact.size_bytes),
            uploaded_at: Some(artifact.uploaded_at),
            message: None,
        })
    }

    /// Serves a blob through a signed, time-limited token.
    pub async fn read_signed(&self, token: Uuid) -> Result<(String, Vec<u8>)> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT storage_path FROM firmware_download_tokens \
             WHERE token = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some((storage_path,)) = row else {
            return Err(Error::ArtifactNotFound(token.to_string()));
        };

        self.read_blob(&storage_path).await
    }

    /// Public fallback path; serves only the currently retained artifact.
    pub async fn read_public(&self, device_id: &str, filename: &str) -> Result<(String, Vec<u8>)> {
        if !safe_filename(filename) {
            return Err(Error::Validation(format!("Invalid filename: {}", filename)));
        }

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT storage_path FROM firmware_artifacts \
             WHERE device_id = $1 AND filename = $2",
        )
        .bind(device_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        let Some((storage_path,)) = row else {
            return Err(Error::ArtifactNotFound(format!(
                "{}/{}",
                device_id, filename
            )));
        };

        self.read_blob(&storage_path).await
    }

    async fn read_blob(&self, storage_path: &str) -> Result<(String, Vec<u8>)> {
        let path = self.data_dir.join(storage_path);
        let bytes = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ArtifactNotFound(storage_path.to_string())
            } else {
                Error::Io(e)
            }
        })?;

        let filename = storage_path
            .rsplit('/')
            .next()
            .unwrap_or(storage_path)
            .to_string();
        Ok((filename, bytes))
    }

    async fn remove_existing(&self, device_id: &str, device_dir: &Path) -> Result<()> {
        sqlx::query("DELETE FROM firmware_artifacts WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        // Blob cleanup is best-effort; a leftover file is unreachable
        // once its index row is gone.
        if let Ok(mut entries) = fs::read_dir(device_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove stale blob {:?}: {}", entry.path(), e);
                }
            }
        }

        Ok(())
    }

    async fn signed_or_public_url(
        &self,
        device_id: &str,
        storage_path: &str,
        filename: &str,
    ) -> String {
        match self.mint_token(device_id, storage_path).await {
            Ok(token) => format!("{}/api/v1/firmware/file/{}", self.base_url, token),
            Err(e) => {
                warn!("Signed URL unavailable, falling back to public URL: {}", e);
                format!(
                    "{}/api/v1/firmware/public/{}/{}",
                    self.base_url, device_id, filename
                )
            }
        }
    }

    async fn mint_token(&self, device_id: &str, storage_path: &str) -> Result<Uuid> {
        let token = Uuid::new_v4();
        let expires_at = Utc::now() + ChronoDuration::seconds(SIGNED_URL_TTL_SECS);

        sqlx::query(
            "INSERT INTO firmware_download_tokens (token, device_id, storage_path, expires_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(token)
        .bind(device_id)
        .bind(storage_path)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(token)
    }

    fn device_dir(&self, device_id: &str) -> PathBuf {
        self.data_dir.join("firmware").join(device_id)
    }
}

/// True iff the device's reported version string-equals the stored tag.
/// Equality, not ordering: a device running a newer build than the store
/// is still offered the stored artifact.
pub fn is_up_to_date(current_version: Option<&str>, stored_version: &str) -> bool {
    current_version == Some(stored_version)
}

fn safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Deletes expired download tokens on a fixed interval.
pub async fn run_token_sweeper(pool: PgPool, sweep_interval: Duration) {
    info!(
        "Starting download-token sweeper, interval {:?}",
        sweep_interval
    );

    let mut ticker = interval(sweep_interval);
    loop {
        ticker.tick().await;

        match sqlx::query("DELETE FROM firmware_download_tokens WHERE expires_at <= NOW()")
            .execute(&pool)
            .await
        {
            Ok(res) if res.rows_affected() > 0 => {
                debug!("Swept {} expired download tokens", res.rows_affected());
            }
            Ok(_) => {}
            Err(e) => warn!("Token sweep failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lazy_store(data_dir: impl Into<PathBuf>) -> FirmwareStore {
        // connect_lazy never touches the network; these tests only
        // exercise the blob side of the store.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        FirmwareStore::new(pool, data_dir, "http://localhost:8080")
    }

    #[test]
    fn test_version_tag_format() {
        let at = Utc.with_ymd_and_hms(2025, 8, 1, 12, 30, 45).unwrap();
        let tag = FirmwareStore::version_tag(at);
        assert_eq!(tag, "20250801123045");
        assert_eq!(tag.len(), 14);
        assert!(tag.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_version_equality_not_ordering() {
        assert!(is_up_to_date(Some("20250801123045"), "20250801123045"));
        // An older device version gets the update...
        assert!(!is_up_to_date(Some("20250701000000"), "20250801123045"));
        // ...and so does a *newer* one: monotonicity is the uploader's
        // responsibility, not the check's.
        assert!(!is_up_to_date(Some("20250901000000"), "20250801123045"));
        assert!(!is_up_to_date(None, "20250801123045"));
    }

    #[test]
    fn test_safe_filename() {
        assert!(safe_filename("app.bin"));
        assert!(safe_filename("meter-v2.ino.bin"));
        assert!(!safe_filename(""));
        assert!(!safe_filename("../../etc/passwd"));
        assert!(!safe_filename("a/b.bin"));
        assert!(!safe_filename("a\\b.bin"));
    }

    #[test]
    fn test_read_blob_roundtrip() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = lazy_store(dir.path());

            let device_dir = dir.path().join("firmware").join("dev-1");
            std::fs::create_dir_all(&device_dir).unwrap();
            std::fs::write(device_dir.join("20250801123045_app.bin"), b"\xDE\xAD\xBE\xEF")
                .unwrap();

            let (filename, bytes) = store
                .read_blob("firmware/dev-1/20250801123045_app.bin")
                .await
                .unwrap();
            assert_eq!(filename, "20250801123045_app.bin");
            assert_eq!(bytes, b"\xDE\xAD\xBE\xEF");
        });
    }

    #[test]
    fn test_read_blob_missing_is_not_found() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = lazy_store(dir.path());

            let err = store.read_blob("firmware/dev-1/nope.bin").await.unwrap_err();
            assert!(matches!(err, Error::ArtifactNotFound(_)));
        });
    }
}
