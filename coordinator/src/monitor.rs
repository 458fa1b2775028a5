use crate::errors::Result;
use crate::model::OtaStatusRecord;
use crate::ota;
use crate::watch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Silence window before an active-phase display is dropped.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(5);
/// How long a failure stays on screen.
pub const FAILURE_DISPLAY: Duration = Duration::from_secs(5);
/// How long a no-update notice stays on screen.
pub const NO_UPDATE_DISPLAY: Duration = Duration::from_secs(2);
/// Stored statuses older than this are not replayed on mount.
pub const RECONCILE_MAX_AGE_MINS: i64 = 5;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Downloading,
    Installing,
    Complete,
    Failed,
    NoUpdate,
}

impl Phase {
    /// Maps a stored status string to a display phase. Heartbeats and
    /// unrecognized statuses map to nothing and leave the display alone.
    pub fn parse(status: &str) -> Option<Phase> {
        match status {
            "starting" => Some(Phase::Starting),
            "downloading" => Some(Phase::Downloading),
            "installing" => Some(Phase::Installing),
            "complete" => Some(Phase::Complete),
            "failed" => Some(Phase::Failed),
            "no_update" => Some(Phase::NoUpdate),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Phase::Starting | Phase::Downloading | Phase::Installing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    Success(String),
    Failure { message: String, hints: Vec<String> },
    Info(String),
}

/// What an observer renders. `Shown`/`Hidden` bracket the visible
/// lifetime of the progress display; `Progress` carries the state to
/// paint; `Notify` is a one-shot toast.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum MonitorEvent {
    Shown,
    Progress {
        phase: Phase,
        progress: u8,
        message: String,
    },
    Notify(Notice),
    Hidden,
}

/// True when a stored status is worth replaying into a freshly mounted
/// monitor: recent enough, and mid-rollout rather than settled.
pub fn should_replay(record: &OtaStatusRecord, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(record.updated_at);
    if age > chrono::Duration::minutes(RECONCILE_MAX_AGE_MINS) {
        return false;
    }
    matches!(Phase::parse(&record.status), Some(p) if p.is_active())
}

/// Maps a reported progress value to what the display shows. Installing
/// occupies the 90..100 band so the bar never appears to restart after
/// the download finishes.
fn display_progress(phase: Phase, reported: i32) -> u8 {
    let p = match phase {
        Phase::Starting => 0,
        Phase::Downloading => reported,
        Phase::Installing => 90 + reported / 10,
        Phase::Complete | Phase::NoUpdate => 100,
        Phase::Failed | Phase::Idle => 0,
    };
    p.clamp(0, 100) as u8
}

fn default_message(phase: Phase, progress: u8) -> String {
    match phase {
        Phase::Starting => "Starting firmware update...".to_string(),
        Phase::Downloading => format!("Downloading firmware... {}%", progress),
        Phase::Installing => "Installing firmware... Please do not power off device".to_string(),
        Phase::Complete => "Firmware update completed successfully".to_string(),
        Phase::Failed => "Firmware update failed".to_string(),
        Phase::NoUpdate => "No firmware updates available".to_string(),
        Phase::Idle => String::new(),
    }
}

fn failure_hints() -> Vec<String> {
    vec![
        "Check device internet connection".to_string(),
        "Ensure device has sufficient storage".to_string(),
        "Verify firmware file is valid".to_string(),
    ]
}

struct MonitorState {
    device_id: String,
    phase: Phase,
    visible: bool,
    deadline: Option<Instant>,
    events: mpsc::Sender<MonitorEvent>,
    closed: bool,
}

impl MonitorState {
    async fn emit(&mut self, event: MonitorEvent) {
        if self.closed {
            return;
        }
        if self.events.send(event).await.is_err() {
            self.closed = true;
        }
    }

    async fn show(&mut self) {
        if !self.visible {
            self.visible = true;
            self.emit(MonitorEvent::Shown).await;
        }
    }

    async fn hide(&mut self) {
        if self.visible {
            self.visible = false;
            self.emit(MonitorEvent::Hidden).await;
        }
        self.deadline = None;
        self.phase = Phase::Idle;
    }

    async fn apply(&mut self, record: &OtaStatusRecord) {
        let Some(phase) = Phase::parse(&record.status) else {
            // Heartbeats keep the channel alive without touching the
            // display.
            return;
        };

        let progress = display_progress(phase, record.progress);
        let message = record
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_message(phase, progress));

        debug!(
            "Monitor {}: {:?} at {}%",
            self.device_id, phase, progress
        );

        self.phase = phase;
        self.show().await;
        self.emit(MonitorEvent::Progress {
            phase,
            progress,
            message,
        })
        .await;

        match phase {
            Phase::Starting | Phase::Downloading | Phase::Installing => {
                // Liveness watchdog, re-armed by every report: a device
                // going silent mid-update must not leave the display up
                // forever.
                self.deadline = Some(Instant::now() + LIVENESS_WINDOW);
            }
            Phase::Complete => {
                self.emit(MonitorEvent::Notify(Notice::Success(
                    "Firmware update completed successfully".to_string(),
                )))
                .await;
                // Hide on the next scheduling tick, not this one, so the
                // 100% state gets a final paint.
                self.deadline = Some(Instant::now());
            }
            Phase::Failed => {
                self.emit(MonitorEvent::Notify(Notice::Failure {
                    message: "Firmware update failed".to_string(),
                    hints: failure_hints(),
                }))
                .await;
                self.deadline = Some(Instant::now() + FAILURE_DISPLAY);
            }
            Phase::NoUpdate => {
                self.emit(MonitorEvent::Notify(Notice::Info(
                    "Device is already up to date".to_string(),
                )))
                .await;
                self.deadline = Some(Instant::now() + NO_UPDATE_DISPLAY);
            }
            Phase::Idle => {}
        }
    }
}

/// Drives the progress display for one device: consumes status reports,
/// emits display events, and hides the display when its deadline (the
/// liveness watchdog or a terminal-state dwell) passes. Runs until the
/// report stream closes or the event receiver goes away.
pub async fn run(
    device_id: String,
    initial: Option<OtaStatusRecord>,
    mut reports: mpsc::Receiver<OtaStatusRecord>,
    events: mpsc::Sender<MonitorEvent>,
) {
    let mut state = MonitorState {
        device_id,
        phase: Phase::Idle,
        visible: false,
        deadline: None,
        events,
        closed: false,
    };

    // A dashboard opened mid-rollout picks up where the device is
    // instead of sitting idle until the next report.
    if let Some(record) = initial.filter(|r| should_replay(r, Utc::now())) {
        state.apply(&record).await;
    }

    loop {
        if state.closed {
            break;
        }

        match state.deadline {
            Some(deadline) => {
                tokio::select! {
                    maybe_report = reports.recv() => match maybe_report {
                        Some(record) => state.apply(&record).await,
                        None => break,
                    },
                    _ = sleep_until(deadline) => {
                        state.hide().await;
                    }
                }
            }
            None => match reports.recv().await {
                Some(record) => state.apply(&record).await,
                None => break,
            },
        }
    }

    // Observer went away; drop the display with it.
    state.hide().await;
}

/// Wires a monitor to the status projection: one-shot reconciliation
/// fetch, a watch task feeding it, and teardown of the watch when the
/// monitor stops.
pub async fn spawn_monitor(
    pool: PgPool,
    device_id: String,
    poll_interval: Duration,
) -> Result<(JoinHandle<()>, mpsc::Receiver<MonitorEvent>)> {
    let initial = ota::latest_status(&pool, &device_id).await?;
    let (watch_handle, reports) = watch::watch_status(pool, device_id.clone(), poll_interval);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        run(device_id, initial, reports, events_tx).await;
        watch_handle.abort();
    });

    Ok((handle, events_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(status: &str, progress: i32) -> OtaStatusRecord {
        OtaStatusRecord {
            device_id: "dev-1".to_string(),
            status: status.to_string(),
            progress,
            message: None,
            firmware_version: None,
            reported_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn spawn_run(
        initial: Option<OtaStatusRecord>,
    ) -> (
        mpsc::Sender<OtaStatusRecord>,
        mpsc::Receiver<MonitorEvent>,
        JoinHandle<()>,
    ) {
        let (report_tx, report_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(run("dev-1".to_string(), initial, report_rx, event_tx));
        (report_tx, event_rx, task)
    }

    async fn drain(task: JoinHandle<()>, mut rx: mpsc::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        task.await.unwrap();
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn progresses(events: &[MonitorEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_completes_at_100_then_hides() {
        let (report_tx, event_rx, task) = spawn_run(None);

        for (status, progress) in [
            ("starting", 0),
            ("downloading", 40),
            ("downloading", 90),
            ("complete", 100),
        ] {
            report_tx.send(record(status, progress)).await.unwrap();
        }
        drop(report_tx);

        let events = drain(task, event_rx).await;

        assert_eq!(events.first(), Some(&MonitorEvent::Shown));
        assert_eq!(progresses(&events), vec![0, 40, 90, 100]);
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::Notify(Notice::Success(_)))));
        assert_eq!(events.last(), Some(&MonitorEvent::Hidden));
        // Shown and Hidden exactly once each.
        assert_eq!(
            events.iter().filter(|e| **e == MonitorEvent::Shown).count(),
            1
        );
        assert_eq!(
            events.iter().filter(|e| **e == MonitorEvent::Hidden).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_hides_after_silence() {
        let (report_tx, mut event_rx, task) = spawn_run(None);

        report_tx.send(record("starting", 0)).await.unwrap();

        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress { .. })
        ));
        // No further report: the paused clock advances to the watchdog
        // deadline and the display drops on its own.
        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Hidden));

        // The monitor is back to idle but still alive; a new report
        // brings the display back.
        report_tx.send(record("downloading", 10)).await.unwrap();
        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));

        drop(report_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_rearm_watchdog() {
        let (report_tx, mut event_rx, task) = spawn_run(None);

        report_tx.send(record("downloading", 10)).await.unwrap();
        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress { .. })
        ));

        // Keep reporting inside the liveness window; the display must
        // stay up through all of it.
        for progress in [30, 50, 70] {
            tokio::time::sleep(Duration::from_secs(3)).await;
            report_tx.send(record("downloading", progress)).await.unwrap();
            assert!(matches!(
                event_rx.recv().await,
                Some(MonitorEvent::Progress { .. })
            ));
        }

        // Then silence: now the watchdog fires.
        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Hidden));

        drop(report_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_ignored() {
        let (report_tx, event_rx, task) = spawn_run(None);

        report_tx.send(record("heartbeat", 0)).await.unwrap();
        report_tx.send(record("heartbeat", 0)).await.unwrap();
        drop(report_tx);

        let events = drain(task, event_rx).await;
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_notifies_with_hints_then_hides() {
        let (report_tx, mut event_rx, task) = spawn_run(None);

        report_tx.send(record("downloading", 60)).await.unwrap();
        report_tx.send(record("failed", 0)).await.unwrap();

        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress { .. })
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress {
                phase: Phase::Failed,
                progress: 0,
                ..
            })
        ));
        match event_rx.recv().await {
            Some(MonitorEvent::Notify(Notice::Failure { hints, .. })) => {
                assert!(!hints.is_empty());
            }
            other => panic!("expected failure notice, got {:?}", other),
        }
        // Failure dwells on screen, then auto-hides.
        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Hidden));

        drop(report_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_update_notifies_then_hides() {
        let (report_tx, mut event_rx, task) = spawn_run(None);

        report_tx.send(record("no_update", 0)).await.unwrap();

        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress { progress: 100, .. })
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Notify(Notice::Info(_)))
        ));
        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Hidden));

        drop(report_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_installing_maps_into_final_band() {
        let (report_tx, mut event_rx, task) = spawn_run(None);

        report_tx.send(record("installing", 50)).await.unwrap();

        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress { progress: 95, .. })
        ));

        drop(report_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_active_status_is_replayed_on_mount() {
        let (_report_tx, mut event_rx, _task) =
            spawn_run(Some(record("downloading", 40)));

        assert_eq!(event_rx.recv().await, Some(MonitorEvent::Shown));
        assert!(matches!(
            event_rx.recv().await,
            Some(MonitorEvent::Progress { progress: 40, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_status_is_not_replayed_on_mount() {
        let (report_tx, event_rx, task) = spawn_run(Some(record("complete", 100)));
        drop(report_tx);

        let events = drain(task, event_rx).await;
        assert!(events.is_empty());
    }

    #[test]
    fn test_should_replay_staleness_cutoff() {
        let now = Utc::now();

        let recent = record("downloading", 40);
        assert!(should_replay(&recent, now));

        let mut stale = record("downloading", 40);
        stale.updated_at = now - ChronoDuration::minutes(RECONCILE_MAX_AGE_MINS + 1);
        assert!(!should_replay(&stale, now));

        let settled = record("complete", 100);
        assert!(!should_replay(&settled, now));

        let heartbeat = record("heartbeat", 0);
        assert!(!should_replay(&heartbeat, now));
    }

    #[test]
    fn test_display_progress_clamped() {
        assert_eq!(display_progress(Phase::Downloading, 150), 100);
        assert_eq!(display_progress(Phase::Downloading, -10), 0);
        assert_eq!(display_progress(Phase::Installing, 100), 100);
        assert_eq!(display_progress(Phase::Installing, 0), 90);
        assert_eq!(display_progress(Phase::Starting, 80), 0);
    }
}
