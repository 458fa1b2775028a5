use serde::{Deserialize, Serialize};

/// Coordinator's answer to the reset-command poll.
#[derive(Debug, Deserialize)]
pub struct ResetCommandResponse {
    pub reset_command: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OtaCheckRequest<'a> {
    pub device_id: &'a str,
    pub current_firmware_version: &'a str,
}

/// Coordinator's answer to the update-negotiation poll.
#[derive(Debug, Deserialize)]
pub struct OtaCheckResponse {
    pub has_update: bool,
    #[serde(default)]
    pub firmware_url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Progress report pushed to the coordinator during a rollout.
/// `timestamp` is the device clock in epoch seconds.
#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub device_id: &'a str,
    pub status: &'a str,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<&'a str>,
}
