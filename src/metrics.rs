// Prometheus metrics definitions for the trivia backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Tournaments currently ACTIVE, as last seen by the lifecycle worker.
    pub static ref ACTIVE_TOURNAMENTS: IntGauge =
        IntGauge::new("trivia_active_tournaments", "Tournaments currently active").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Sessions handed out by start, by kind (new, resumed).
    pub static ref SESSIONS_STARTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_sessions_started_total", "Sessions created or resumed"),
        &["kind"],
    )
    .unwrap();

    /// Start calls turned away, by reason (energy_depleted, rate_limited).
    pub static ref START_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_start_rejections_total", "Start calls rejected"),
        &["reason"],
    )
    .unwrap();

    /// Sessions closed, by outcome (finished, abandoned, completed_on_resume).
    pub static ref SESSIONS_CLOSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_sessions_closed_total", "Sessions closed"),
        &["outcome"],
    )
    .unwrap();

    /// Synthetic timeout answers written when resuming a session.
    pub static ref TIMEOUT_ANSWERS_TOTAL: IntCounter = IntCounter::new(
        "trivia_timeout_answers_total",
        "Timeout answers backfilled on resume",
    )
    .unwrap();

    /// Bonus energy spent on starts past the free allowance.
    pub static ref BONUS_ENERGY_SPENT_TOTAL: IntCounter = IntCounter::new(
        "trivia_bonus_energy_spent_total",
        "Bonus energy spent",
    )
    .unwrap();

    /// Tournament stage outcomes at finish, by tag.
    pub static ref STAGE_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_stage_outcomes_total", "Tournament stage outcomes"),
        &["outcome"],
    )
    .unwrap();

    /// Notifications written to the outbox, by kind.
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_notifications_sent_total", "Notifications dispatched"),
        &["kind"],
    )
    .unwrap();

    /// Failures swallowed by best-effort steps, by subsystem.
    pub static ref BEST_EFFORT_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_best_effort_failures_total", "Best-effort step failures"),
        &["subsystem"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Final game scores.
    pub static ref GAME_SCORE: HistogramVec = HistogramVec::new(
        HistogramOpts::new("trivia_game_score", "Final game score")
            .buckets(vec![0.0, 250.0, 500.0, 1000.0, 1500.0, 2000.0, 3000.0, 5000.0]),
        &["kind"],
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "trivia_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_TOURNAMENTS.clone()),
        Box::new(SESSIONS_STARTED_TOTAL.clone()),
        Box::new(START_REJECTIONS_TOTAL.clone()),
        Box::new(SESSIONS_CLOSED_TOTAL.clone()),
        Box::new(TIMEOUT_ANSWERS_TOTAL.clone()),
        Box::new(BONUS_ENERGY_SPENT_TOTAL.clone()),
        Box::new(STAGE_OUTCOMES_TOTAL.clone()),
        Box::new(NOTIFICATIONS_SENT_TOTAL.clone()),
        Box::new(BEST_EFFORT_FAILURES_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(GAME_SCORE.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::warn!("Metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Count a swallowed failure of a best-effort step and log it.
pub fn best_effort_failure(subsystem: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(subsystem, "Best-effort step failed: {error}");
    BEST_EFFORT_FAILURES_TOTAL.with_label_values(&[subsystem]).inc();
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/tournaments"), "/api/tournaments");
        assert_eq!(normalize_path("/api/quiz/42/start"), "/api/quiz/:id/start");
        assert_eq!(
            normalize_path("/api/tournaments/7/standings"),
            "/api/tournaments/:id/standings"
        );
    }

    #[test]
    fn test_register_twice_does_not_panic() {
        register_metrics();
        register_metrics();
        SESSIONS_STARTED_TOTAL.with_label_values(&["new"]).inc();
        let output = gather_metrics();
        assert!(output.contains("trivia_sessions_started_total"));
    }

    #[test]
    fn test_best_effort_failure_counts() {
        let before = BEST_EFFORT_FAILURES_TOTAL
            .with_label_values(&["unit_test"])
            .get();
        best_effort_failure("unit_test", &"boom");
        assert_eq!(
            BEST_EFFORT_FAILURES_TOTAL.with_label_values(&["unit_test"]).get(),
            before + 1
        );
    }
}
