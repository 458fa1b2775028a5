mod meter;
mod protocol;
mod rollout;

use clap::Parser;
use meter::Meter;
use protocol::ResetCommandResponse;
use std::time::Duration;
use tracing::{error, info, warn};

/// Simulated embedded energy meter speaking the coordinator's
/// device-facing protocol: polls for reset commands, negotiates
/// firmware updates, and reports OTA progress.
#[derive(Debug, Parser)]
#[command(name = "meter-sim")]
struct Args {
    /// Coordinator base URL
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    server: String,

    /// Device identifier to present to the coordinator
    #[arg(long, env = "DEVICE_ID", default_value = "meter-0001")]
    device_id: String,

    /// Number of metering channels
    #[arg(long, env = "CHANNELS", default_value_t = 3)]
    channels: usize,

    /// Firmware version reported before the first update
    #[arg(long, env = "FIRMWARE_VERSION", default_value = "factory")]
    firmware_version: String,

    /// Seconds between coordinator polls
    #[arg(long, env = "POLL_SECS", default_value_t = 5)]
    poll_secs: u64,

    /// Send a heartbeat every N polls (0 disables)
    #[arg(long, env = "HEARTBEAT_EVERY", default_value_t = 6)]
    heartbeat_every: u64,

    /// Probability that a simulated rollout fails mid-download
    #[arg(long, env = "FAILURE_RATE", default_value_t = 0.0)]
    failure_rate: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting meter simulator");
    info!(
        "Coordinator: {}, device: {}, channels: {}",
        args.server, args.device_id, args.channels
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        });

    let mut meter = Meter::new(args.channels);
    let mut firmware_version = args.firmware_version.clone();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.poll_secs));
    let mut polls: u64 = 0;

    loop {
        ticker.tick().await;
        polls += 1;

        meter.accumulate();

        if let Some(command) = check_reset(&client, &args.server, &args.device_id).await {
            if command.reset_command {
                meter.reset();
                info!(
                    "Energy counters reset: {}",
                    command.message.as_deref().unwrap_or("acknowledged")
                );
            }
        }

        match rollout::check_for_update(&client, &args.server, &args.device_id, &firmware_version)
            .await
        {
            Some(update) if update.has_update => {
                if let Some(version) = rollout::run_rollout(
                    &client,
                    &args.server,
                    &args.device_id,
                    &update,
                    args.failure_rate,
                )
                .await
                {
                    firmware_version = version;
                }
                // The rollout already reported; no heartbeat this poll.
                continue;
            }
            _ => {}
        }

        if args.heartbeat_every > 0 && polls % args.heartbeat_every == 0 {
            rollout::send_heartbeat(&client, &args.server, &args.device_id, &firmware_version)
                .await;
            info!(
                "Heartbeat sent, total consumption {:.1} Wh",
                meter.total_wh()
            );
        }
    }
}

async fn check_reset(
    client: &reqwest::Client,
    base_url: &str,
    device_id: &str,
) -> Option<ResetCommandResponse> {
    match client
        .get(format!("{}/api/v1/reset/check", base_url))
        .query(&[("device_id", device_id)])
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => match resp.json::<ResetCommandResponse>().await {
            Ok(command) => Some(command),
            Err(e) => {
                warn!("Malformed reset-check response: {}", e);
                None
            }
        },
        Ok(resp) => {
            warn!("Reset check failed: HTTP {}", resp.status());
            None
        }
        Err(e) => {
            warn!("Reset check failed: {}", e);
            None
        }
    }
}
