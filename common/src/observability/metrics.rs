//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is created per session. Each context owns its own
//! registry so several sessions (or tests) never collide on registration.

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus metrics registry + handles.
///
/// Hot-path instrumentation is just counter increments and histogram
/// observations on the public handles.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Controller traffic
    pub messages_received_total: IntCounter,
    pub indications_total: IntCounter,
    pub confirmations_total: IntCounter,
    pub requests_sent_total: IntCounter,
    pub requests_failed_total: IntCounter,
    pub reconnects_total: IntCounter,

    // Call lifecycle
    pub calls_dialed_total: IntCounter,
    pub calls_accepted_total: IntCounter,
    pub calls_rejected_total: IntCounter,
    pub active_connections: IntGauge,

    // Recording
    pub recorder_frames_flushed_total: IntCounter,

    // Latency histograms (seconds)
    pub indication_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("capi_phone".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )
        .context("failed to create metrics registry")?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let messages_received_total = counter(
            "capi_messages_received_total",
            "Total messages fetched from the controller",
        )?;
        let indications_total =
            counter("capi_indications_total", "Total indications dispatched")?;
        let confirmations_total =
            counter("capi_confirmations_total", "Total confirmations dispatched")?;
        let requests_sent_total = counter(
            "capi_requests_sent_total",
            "Total requests and responses sent to the controller",
        )?;
        let requests_failed_total = counter(
            "capi_requests_failed_total",
            "Total requests rejected with a non-zero info code",
        )?;
        let reconnects_total = counter(
            "capi_reconnects_total",
            "Total re-registrations after a transient receive failure",
        )?;
        let calls_dialed_total = counter("calls_dialed_total", "Total outbound calls started")?;
        let calls_accepted_total = counter(
            "calls_accepted_total",
            "Total inbound calls admitted to the connection table",
        )?;
        let calls_rejected_total = counter(
            "calls_rejected_total",
            "Total inbound calls rejected without allocating a connection",
        )?;
        let recorder_frames_flushed_total = counter(
            "recorder_frames_flushed_total",
            "Total stereo frames written to recording sinks",
        )?;

        let active_connections = IntGauge::with_opts(Opts::new(
            "active_connections",
            "Connection table slots currently in use",
        ))?;
        registry.register(Box::new(active_connections.clone()))?;

        let indication_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "capi_indication_seconds",
                "Time spent handling one indication (seconds)",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(indication_seconds.clone()))?;

        Ok(Self {
            registry,
            messages_received_total,
            indications_total,
            confirmations_total,
            requests_sent_total,
            requests_failed_total,
            reconnects_total,
            calls_dialed_total,
            calls_accepted_total,
            calls_rejected_total,
            active_connections,
            recorder_frames_flushed_total,
            indication_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// The host decides how to serve it (HTTP endpoint, log line, file).
    pub fn encode_text(&self) -> Result<String> {
        // ---
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output is not UTF-8")
    }
}
