//! Metrics module
//!
//! Prometheus collectors for verification, key set and HTTP activity.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_gauge, CounterVec, Encoder,
    Histogram, IntGauge, TextEncoder,
};

lazy_static! {
    // Verification metrics
    pub static ref VERIFICATIONS_TOTAL: CounterVec = register_counter_vec!(
        "komainu_token_verifications_total",
        "Token verifications by outcome",
        &["outcome"]  // "ok" or a rejection reason
    ).unwrap();

    pub static ref VERIFY_DURATION: Histogram = register_histogram!(
        "komainu_token_verify_duration_seconds",
        "Token verification duration in seconds",
        vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Key set metrics
    pub static ref KEY_FETCHES_TOTAL: CounterVec = register_counter_vec!(
        "komainu_key_set_fetches_total",
        "Key set fetch attempts",
        &["status"]
    ).unwrap();

    pub static ref KEY_SET_GENERATION: IntGauge = register_int_gauge!(
        "komainu_key_set_generation",
        "Generation of the key set currently served"
    ).unwrap();

    // Authorization metrics
    pub static ref AUTHZ_DECISIONS_TOTAL: CounterVec = register_counter_vec!(
        "komainu_authz_decisions_total",
        "Permission checks by decision",
        &["decision"]
    ).unwrap();

    // HTTP metrics
    pub static ref HTTP_RESPONSES_TOTAL: CounterVec = register_counter_vec!(
        "komainu_http_responses_total",
        "HTTP responses by route and status",
        &["route", "status"]
    ).unwrap();
}

/// Record a verification outcome and its duration
pub fn record_verification(outcome: &str, duration_secs: f64) {
    VERIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
    VERIFY_DURATION.observe(duration_secs);
}

/// Record one key set fetch attempt
pub fn record_key_fetch(success: bool) {
    let status = if success { "success" } else { "failure" };
    KEY_FETCHES_TOTAL.with_label_values(&[status]).inc();
}

/// Record the generation of a freshly installed key set
pub fn record_key_set_generation(generation: u64) {
    KEY_SET_GENERATION.set(i64::try_from(generation).unwrap_or(i64::MAX));
}

/// Record an authorization decision
pub fn record_authz_decision(allowed: bool) {
    let decision = if allowed { "allow" } else { "deny" };
    AUTHZ_DECISIONS_TOTAL.with_label_values(&[decision]).inc();
}

/// Record an HTTP response
pub fn record_response(route: &str, status: u16) {
    HTTP_RESPONSES_TOTAL
        .with_label_values(&[route, &status.to_string()])
        .inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
