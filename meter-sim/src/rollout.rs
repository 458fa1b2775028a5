use crate::protocol::{OtaCheckRequest, OtaCheckResponse, StatusReport};
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_REPORT_ATTEMPTS: u32 = 3;
const REPORT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Asks the coordinator whether newer firmware is stored for us.
pub async fn check_for_update(
    client: &Client,
    base_url: &str,
    device_id: &str,
    current_version: &str,
) -> Option<OtaCheckResponse> {
    let request = OtaCheckRequest {
        device_id,
        current_firmware_version: current_version,
    };

    match client
        .post(format!("{}/api/v1/ota/check", base_url))
        .json(&request)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => match resp.json::<OtaCheckResponse>().await {
            Ok(check) => Some(check),
            Err(e) => {
                warn!("Malformed update-check response: {}", e);
                None
            }
        },
        Ok(resp) => {
            warn!("Update check failed: HTTP {}", resp.status());
            None
        }
        Err(e) => {
            warn!("Update check failed: {}", e);
            None
        }
    }
}

/// Simulates one firmware rollout: staged progress reports, a download
/// of the actual artifact, install, and the final verdict. Returns the
/// adopted version on success.
pub async fn run_rollout(
    client: &Client,
    base_url: &str,
    device_id: &str,
    update: &OtaCheckResponse,
    failure_rate: f64,
) -> Option<String> {
    let version = update.firmware_version.clone()?;
    let url = update.firmware_url.clone()?;

    info!(
        "Update available: {} (version {}, {} bytes)",
        update.filename.as_deref().unwrap_or("?"),
        version,
        update.file_size.unwrap_or(0)
    );

    send_report(
        client,
        base_url,
        make_report(
            device_id,
            "starting",
            0,
            Some("Starting firmware update".to_string()),
            None,
        ),
    )
    .await;

    // Decide up front whether this rollout is doomed, and where.
    let fail_at = if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.clamp(0.0, 1.0))
    {
        Some(rand::thread_rng().gen_range(10..90))
    } else {
        None
    };

    let mut progress = 0i32;
    while progress < 100 {
        progress = (progress + rand::thread_rng().gen_range(7..18)).min(100);

        if let Some(fail_at) = fail_at {
            if progress >= fail_at {
                warn!("Simulated download interruption at {}%", progress);
                send_report(
                    client,
                    base_url,
                    make_report(
                        device_id,
                        "failed",
                        0,
                        Some("Download interrupted".to_string()),
                        None,
                    ),
                )
                .await;
                return None;
            }
        }

        send_report(
            client,
            base_url,
            make_report(device_id, "downloading", progress, None, None),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(
            rand::thread_rng().gen_range(150..400),
        ))
        .await;
    }

    // Fetch the artifact itself; a real meter streams this to flash.
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
            Ok(bytes) => info!("Downloaded {} bytes of firmware", bytes.len()),
            Err(e) => {
                warn!("Firmware download failed mid-body: {}", e);
                send_report(
                    client,
                    base_url,
                    make_report(
                        device_id,
                        "failed",
                        0,
                        Some("Firmware download failed".to_string()),
                        None,
                    ),
                )
                .await;
                return None;
            }
        },
        Ok(resp) => {
            warn!("Firmware download failed: HTTP {}", resp.status());
            send_report(
                client,
                base_url,
                make_report(
                    device_id,
                    "failed",
                    0,
                    Some("Firmware download failed".to_string()),
                    None,
                ),
            )
            .await;
            return None;
        }
        Err(e) => {
            warn!("Firmware download failed: {}", e);
            send_report(
                client,
                base_url,
                make_report(
                    device_id,
                    "failed",
                    0,
                    Some("Firmware download failed".to_string()),
                    None,
                ),
            )
            .await;
            return None;
        }
    }

    for step in [0, 50, 100] {
        send_report(
            client,
            base_url,
            make_report(device_id, "installing", step, None, None),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    send_report(
        client,
        base_url,
        make_report(
            device_id,
            "complete",
            100,
            Some("Firmware update completed".to_string()),
            Some(version.as_str()),
        ),
    )
    .await;

    info!("Firmware {} installed, rebooting into new image", version);
    Some(version)
}

pub async fn send_heartbeat(client: &Client, base_url: &str, device_id: &str, version: &str) {
    send_report(
        client,
        base_url,
        make_report(device_id, "heartbeat", 0, None, Some(version)),
    )
    .await;
}

fn make_report<'a>(
    device_id: &'a str,
    status: &'a str,
    progress: i32,
    message: Option<String>,
    firmware_version: Option<&'a str>,
) -> StatusReport<'a> {
    StatusReport {
        device_id,
        status,
        progress,
        message,
        timestamp: chrono::Utc::now().timestamp(),
        firmware_version,
    }
}

/// Fixed-backoff delivery. Transport errors are retried; a rejection is
/// not, since the report will not become valid on its own.
async fn send_report(client: &Client, base_url: &str, report: StatusReport<'_>) {
    for attempt in 1..=MAX_REPORT_ATTEMPTS {
        match client
            .post(format!("{}/api/v1/ota/status", base_url))
            .json(&report)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => {
                warn!("Status report rejected: HTTP {}", resp.status());
                return;
            }
            Err(e) => {
                warn!(
                    "Status report failed (attempt {}/{}): {}",
                    attempt, MAX_REPORT_ATTEMPTS, e
                );
                if attempt < MAX_REPORT_ATTEMPTS {
                    tokio::time::sleep(REPORT_RETRY_DELAY).await;
                }
            }
        }
    }

    error!(
        "Giving up on status report after {} attempts",
        MAX_REPORT_ATTEMPTS
    );
}
