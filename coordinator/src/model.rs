use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Registry entry for a metering device. The registry is owned by the
/// upstream provisioning service; the coordinator only reads it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    pub name: Option<String>,
    pub channel_count: i32,
}

/// A ledger vote joined with the voter's display name, when the auth
/// service has a profile for them. The ledger's `(device_id, user_id)`
/// uniqueness constraint is the only thing preventing double votes.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AnnotatedVote {
    pub user_id: String,
    pub voted_at: DateTime<Utc>,
    pub full_name: Option<String>,
}

/// A bounded-lifetime voting round for one device.
///
/// Status lifecycle: `voting` -> `executing` (quorum reached) ->
/// `completed` (device acknowledged). A session whose `expires_at` has
/// passed while still `voting` is ignored by all lookups.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ResetSession {
    pub id: Uuid,
    pub device_id: String,
    pub status: String,
    pub required_votes: i32,
    pub votes_received: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// The single retained firmware binary for a device. Blobs live on disk
/// under `{data_dir}/{storage_path}`; this row is the index entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FirmwareArtifact {
    pub device_id: String,
    pub version: String,
    pub filename: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}

/// Latest-wins projection of a device's OTA progress. One row per device,
/// overwritten on every report; `reported_at` is the device's own clock,
/// `updated_at` is ours.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct OtaStatusRecord {
    pub device_id: String,
    pub status: String,
    pub progress: i32,
    pub message: Option<String>,
    pub firmware_version: Option<String>,
    pub reported_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response to a vote call.
#[derive(Debug, Serialize)]
pub struct VoteOutcome {
    pub success: bool,
    pub votes_received: i64,
    pub required_votes: i32,
    pub reset_triggered: bool,
}

/// Response to a status call.
#[derive(Debug, Serialize)]
pub struct ResetStatus {
    pub session: Option<ResetSession>,
    pub votes: Vec<AnnotatedVote>,
    pub required_votes: i32,
    pub votes_received: i64,
}

/// Response to the device's reset-command poll.
#[derive(Debug, Serialize)]
pub struct ResetCommand {
    pub reset_command: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response to the device's update-negotiation poll.
#[derive(Debug, Serialize)]
pub struct UpdateCheck {
    pub has_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UpdateCheck {
    pub fn none(message: &str) -> Self {
        Self {
            has_update: false,
            firmware_url: None,
            filename: None,
            firmware_version: None,
            file_size: None,
            uploaded_at: None,
            message: Some(message.to_string()),
        }
    }
}

/// Response to a firmware upload.
#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub success: bool,
    pub version: String,
    pub firmware_url: String,
}
