use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref VOTES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "resetvote_votes_total",
        "Total accepted reset votes"
    ))
    .unwrap();
    pub static ref DUPLICATE_VOTES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "resetvote_duplicate_votes_total",
        "Votes rejected by the one-vote-per-user constraint"
    ))
    .unwrap();
    pub static ref SESSIONS_CREATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "resetvote_sessions_created_total",
        "Reset voting sessions opened"
    ))
    .unwrap();
    pub static ref RESETS_TRIGGERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "resetvote_resets_triggered_total",
        "Sessions that reached quorum"
    ))
    .unwrap();
    pub static ref RESET_COMMANDS_CONSUMED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "resetvote_commands_consumed_total",
        "Reset commands acknowledged by devices"
    ))
    .unwrap();
    pub static ref OTA_REPORTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ota_reports_total",
        "OTA status reports accepted"
    ))
    .unwrap();
    pub static ref OTA_INVALID_REPORTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ota_invalid_reports_total",
        "OTA status reports rejected by validation"
    ))
    .unwrap();
    pub static ref FIRMWARE_UPLOADS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "firmware_uploads_total",
        "Firmware artifacts stored"
    ))
    .unwrap();
    pub static ref FIRMWARE_UPDATE_CHECKS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "firmware_update_checks_total",
        "Device update-negotiation requests"
    ))
    .unwrap();
    pub static ref OTA_ACTIVE_WATCHERS: Gauge = Gauge::with_opts(Opts::new(
        "ota_active_watchers",
        "Progress watch tasks currently running"
    ))
    .unwrap();
    pub static ref VOTE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "resetvote_vote_latency_seconds",
            "Time taken to admit a vote and update the session"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(VOTES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DUPLICATE_VOTES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SESSIONS_CREATED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESETS_TRIGGERED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESET_COMMANDS_CONSUMED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(OTA_REPORTS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(OTA_INVALID_REPORTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FIRMWARE_UPLOADS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FIRMWARE_UPDATE_CHECKS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OTA_ACTIVE_WATCHERS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(VOTE_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
