//! Prometheus metrics for the relay and the consumer runtime.
//!
//! Recording goes through the `metrics` facade, so the recorders below are
//! no-ops until [`MetricsServer::start`] or [`MetricsServer::serve`] installs
//! the Prometheus exporter.
//!
//! # Example
//!
//! ```rust,no_run
//! use outbox_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Scrape output is available through `server.render()`
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder and register metric descriptions.
    ///
    /// Scrape output is only available through [`render`](Self::render); use
    /// [`serve`](Self::serve) to expose it over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (e.g. by another test) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Install the Prometheus recorder and serve `/metrics` on [`addr`](Self::addr).
    ///
    /// Must be called from within a Tokio runtime; the HTTP listener runs as a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder is
    /// already installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = Self::builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();

        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display`.
            if exporter.await.is_err() {
                tracing::error!("Metrics endpoint stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Serving Prometheus metrics");
        Ok(())
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Address the metrics are served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Relay
    describe_counter!("outbox_relay_cycles_total", "Relay polling cycles run to completion, empty ones included");
    describe_counter!("outbox_relay_claimed_total", "Outbox records leased by this worker");
    describe_counter!("outbox_relay_published_total", "Outbox records published to their topic");
    describe_counter!(
        "outbox_relay_retried_total",
        "Outbox records scheduled for another attempt"
    );
    describe_counter!(
        "outbox_relay_dead_lettered_total",
        "Outbox records quarantined in a dead-letter sink"
    );
    describe_counter!(
        "outbox_relay_cycle_errors_total",
        "Relay cycles aborted by a store failure"
    );
    describe_histogram!(
        "outbox_relay_cycle_duration_seconds",
        "Time taken by one claim-publish-resolve cycle"
    );

    // Consumer
    describe_counter!(
        "consumer_messages_handled_total",
        "Messages processed successfully by a handler"
    );
    describe_counter!(
        "consumer_messages_dead_lettered_total",
        "Messages forwarded to a consumer dead-letter topic"
    );
    describe_counter!("consumer_handler_failures_total", "Failed handler invocations");
    describe_counter!(
        "consumer_dlq_publish_failures_total",
        "Failed publishes to a consumer dead-letter topic"
    );
}

/// Outbox relay metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record a completed cycle.
    pub fn record_cycle(report: &crate::relay::CycleReport, duration: Duration) {
        counter!("outbox_relay_cycles_total").increment(1);
        counter!("outbox_relay_claimed_total").increment(report.claimed as u64);
        counter!("outbox_relay_published_total").increment(report.published as u64);
        counter!("outbox_relay_retried_total").increment(report.retried as u64);
        counter!("outbox_relay_dead_lettered_total").increment(report.dead_lettered as u64);
        histogram!("outbox_relay_cycle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a cycle aborted by an infrastructure failure.
    pub fn record_cycle_error() {
        counter!("outbox_relay_cycle_errors_total").increment(1);
    }
}

/// Consumer runtime metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a successfully handled message.
    pub fn record_handled(topic: &str) {
        counter!("consumer_messages_handled_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered(topic: &str, reason: &'static str) {
        counter!(
            "consumer_messages_dead_lettered_total",
            "topic" => topic.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a failed handler invocation.
    pub fn record_handler_failure(topic: &str) {
        counter!("consumer_handler_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed dead-letter publish.
    pub fn record_dlq_publish_failure(topic: &str) {
        counter!("consumer_dlq_publish_failures_total", "topic" => topic.to_string()).increment(1);
    }
}
