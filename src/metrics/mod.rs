//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Step progress per protocol
//! - Protocol errors and step failures
//! - Withdraw outcomes per leg
//! - Superseded polls and active flows

use crate::error::{SwapError, SwapResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref STEPS_ENTERED: CounterVec = register_counter_vec!(
        "swap_steps_entered_total",
        "Total step actions started",
        &["protocol", "step"]
    ).unwrap();

    pub static ref STEP_FAILURES: CounterVec = register_counter_vec!(
        "swap_step_failures_total",
        "Total step actions that returned an error and parked",
        &["protocol", "step"]
    ).unwrap();

    pub static ref PROTOCOL_ERRORS: CounterVec = register_counter_vec!(
        "swap_protocol_errors_total",
        "Total protocol violations detected",
        &["protocol", "kind"]
    ).unwrap();

    pub static ref WITHDRAW_OUTCOMES: CounterVec = register_counter_vec!(
        "swap_withdraw_outcomes_total",
        "Withdraw attempts by leg and outcome",
        &["leg", "outcome"]
    ).unwrap();

    pub static ref POLLS_SUPERSEDED: CounterVec = register_counter_vec!(
        "swap_polls_superseded_total",
        "Polls stopped by a newer generation",
        &["name"]
    ).unwrap();

    pub static ref REFUNDS: CounterVec = register_counter_vec!(
        "swap_refunds_total",
        "Total refunds broadcast",
        &["protocol"]
    ).unwrap();

    pub static ref SWAPS_FINISHED: CounterVec = register_counter_vec!(
        "swap_finished_total",
        "Total swaps finished",
        &["protocol"]
    ).unwrap();

    pub static ref ACTIVE_FLOWS: GaugeVec = register_gauge_vec!(
        "swap_active_flows",
        "Flows currently hosted",
        &["peer"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_step_entered(protocol: &str, step: &str) {
    STEPS_ENTERED.with_label_values(&[protocol, step]).inc();
}

pub fn record_step_failure(protocol: &str, step: &str) {
    STEP_FAILURES.with_label_values(&[protocol, step]).inc();
}

pub fn record_protocol_error(protocol: &str, kind: &str) {
    PROTOCOL_ERRORS.with_label_values(&[protocol, kind]).inc();
}

pub fn record_withdraw_outcome(leg: &str, outcome: &str) {
    WITHDRAW_OUTCOMES.with_label_values(&[leg, outcome]).inc();
}

pub fn record_poll_superseded(name: &str) {
    POLLS_SUPERSEDED.with_label_values(&[name]).inc();
}

pub fn record_refund(protocol: &str) {
    REFUNDS.with_label_values(&[protocol]).inc();
}

pub fn record_swap_finished(protocol: &str) {
    SWAPS_FINISHED.with_label_values(&[protocol]).inc();
}

pub fn set_active_flows(peer: &str, count: usize) {
    ACTIVE_FLOWS.with_label_values(&[peer]).set(count as f64);
}
