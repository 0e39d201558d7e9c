//! # Prometheus Metrics
//!
//! Counters for one simulation run. The simulator has no HTTP surface, so
//! the registry is rendered in the text exposition format and printed when
//! the run ends.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Holds all Prometheus metric handles for a run.
///
/// Clone-friendly; the handles are reference counted, so the simulated
/// services and the driver loop can each hold a copy.
#[derive(Clone)]
pub struct SimMetrics {
    registry: Registry,
    /// Transactions submitted through the executor.
    pub requests_total: IntCounter,
    /// Finished requests by outcome (`ok` or an error kind).
    pub request_outcomes_total: IntCounterVec,
    /// Attempts spent on successful requests.
    pub attempts_total: IntCounter,
    /// Calls the simulated nodes dropped or answered BUSY, by fault.
    pub injected_faults_total: IntCounterVec,
    /// Reassembled messages delivered to the subscriber.
    pub messages_received_total: IntCounter,
    /// Stream items the simulated mirror sent.
    pub stream_items_served_total: IntCounter,
    /// Streams the simulated mirror cut short.
    pub stream_breaks_total: IntCounter,
    /// End-to-end request latency in seconds.
    pub request_latency_seconds: Histogram,
}

impl SimMetrics {
    /// Creates and registers all metrics. Call once per run.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ledger_simnet".into()), None)?;

        let requests_total = IntCounter::new("requests_total", "Transactions submitted")?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_outcomes_total = IntCounterVec::new(
            Opts::new("request_outcomes_total", "Finished requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(request_outcomes_total.clone()))?;

        let attempts_total =
            IntCounter::new("attempts_total", "Attempts spent on successful requests")?;
        registry.register(Box::new(attempts_total.clone()))?;

        let injected_faults_total = IntCounterVec::new(
            Opts::new("injected_faults_total", "Faults injected by simulated nodes"),
            &["fault"],
        )?;
        registry.register(Box::new(injected_faults_total.clone()))?;

        let messages_received_total =
            IntCounter::new("messages_received_total", "Reassembled topic messages delivered")?;
        registry.register(Box::new(messages_received_total.clone()))?;

        let stream_items_served_total =
            IntCounter::new("stream_items_served_total", "Stream items sent by the mirror")?;
        registry.register(Box::new(stream_items_served_total.clone()))?;

        let stream_breaks_total =
            IntCounter::new("stream_breaks_total", "Streams cut short by the mirror")?;
        registry.register(Box::new(stream_breaks_total.clone()))?;

        let request_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "request_latency_seconds",
                "End-to-end request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_outcomes_total,
            attempts_total,
            injected_faults_total,
            messages_received_total,
            stream_items_served_total,
            stream_breaks_total,
            request_latency_seconds,
        })
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_carries_the_prefix_and_labels() {
        let metrics = SimMetrics::new().unwrap();
        metrics.requests_total.inc();
        metrics
            .request_outcomes_total
            .with_label_values(&["exhausted_retries"])
            .inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("ledger_simnet_requests_total 1"));
        assert!(text.contains("outcome=\"exhausted_retries\""));
    }
}
