//! Metric vectors for sends, receives, consumer/connection gauges, and errors.
//!
//! Mirrors the shape of the historical `prometheus` exporter this adapter
//! replaces: a handful of counter/gauge/histogram vectors registered once
//! and labelled by `(service, name)` or `(service)`.

use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};

/// Labels shared by per-destination metrics.
#[derive(Debug, Clone)]
pub struct ServiceNameLabels<'a> {
    pub service: &'a str,
    pub name: &'a str,
}

/// Labels shared by per-service (connection-scoped) metrics.
#[derive(Debug, Clone)]
pub struct ServiceLabels<'a> {
    pub service: &'a str,
}

/// Narrow metrics surface the broker-adapter depends on.
///
/// Implementations must be cheap to clone and safe to share across tasks;
/// `PrometheusExporter` and `NilExporter` are both `Clone + Send + Sync`.
pub trait Exporter: Send + Sync {
    fn inc_send_error(&self, labels: ServiceNameLabels<'_>);
    fn inc_receive_error(&self, labels: ServiceNameLabels<'_>);
    fn inc_publish_error(&self, labels: ServiceNameLabels<'_>);
    fn inc_handle_error(&self, labels: ServiceNameLabels<'_>);
    fn inc_error(&self, labels: ServiceLabels<'_>);
    fn inc_consumer(&self, labels: ServiceNameLabels<'_>);
    fn dec_consumer(&self, labels: ServiceNameLabels<'_>);
    fn inc_connection(&self, labels: ServiceLabels<'_>);
    fn dec_connection(&self, labels: ServiceLabels<'_>);
    fn observe_send_seconds(&self, labels: ServiceNameLabels<'_>, seconds: f64);
    fn observe_receive_seconds(&self, labels: ServiceNameLabels<'_>, seconds: f64);
    fn observe_publish_seconds(&self, labels: ServiceNameLabels<'_>, seconds: f64);
    fn observe_handle_seconds(&self, labels: ServiceNameLabels<'_>, seconds: f64);

    /// Renders the current registry in Prometheus text exposition format.
    fn gather(&self) -> String;
}

/// Builds an exporter from the `metric.enabled`/`metric.exporter` config keys.
pub fn create_exporter(enabled: bool, exporter_name: &str) -> Box<dyn Exporter> {
    if !enabled {
        return Box::new(NilExporter);
    }
    match exporter_name {
        _ => Box::new(PrometheusExporter::new()),
    }
}

/// Drop-in no-op used when `metric.enabled = false`.
#[derive(Default, Clone, Copy)]
pub struct NilExporter;

impl Exporter for NilExporter {
    fn inc_send_error(&self, _: ServiceNameLabels<'_>) {}
    fn inc_receive_error(&self, _: ServiceNameLabels<'_>) {}
    fn inc_publish_error(&self, _: ServiceNameLabels<'_>) {}
    fn inc_handle_error(&self, _: ServiceNameLabels<'_>) {}
    fn inc_error(&self, _: ServiceLabels<'_>) {}
    fn inc_consumer(&self, _: ServiceNameLabels<'_>) {}
    fn dec_consumer(&self, _: ServiceNameLabels<'_>) {}
    fn inc_connection(&self, _: ServiceLabels<'_>) {}
    fn dec_connection(&self, _: ServiceLabels<'_>) {}
    fn observe_send_seconds(&self, _: ServiceNameLabels<'_>, _: f64) {}
    fn observe_receive_seconds(&self, _: ServiceNameLabels<'_>, _: f64) {}
    fn observe_publish_seconds(&self, _: ServiceNameLabels<'_>, _: f64) {}
    fn observe_handle_seconds(&self, _: ServiceNameLabels<'_>, _: f64) {}
    fn gather(&self) -> String {
        String::new()
    }
}

struct Vecs {
    send_error: CounterVec,
    receive_error: CounterVec,
    publish_error: CounterVec,
    handle_error: CounterVec,
    error: CounterVec,
    consumer_gauge: GaugeVec,
    connection_gauge: GaugeVec,
    send_duration: HistogramVec,
    receive_duration: HistogramVec,
    publish_duration: HistogramVec,
    handle_duration: HistogramVec,
}

/// Lazily-registered Prometheus exporter. The registry is built on first
/// scrape so unit tests that never call `gather()` never touch the global
/// Prometheus default registry.
pub struct PrometheusExporter {
    registry: OnceLock<Registry>,
    vecs: Vecs,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        let vecs = Vecs {
            send_error: CounterVec::new(
                Opts::new("messageman_jobs_send_errors_total", "Total number of send job errors"),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            receive_error: CounterVec::new(
                Opts::new("messageman_jobs_receive_errors_total", "Total number of receive job errors"),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            publish_error: CounterVec::new(
                Opts::new("messageman_publish_errors_total", "Total number of publish errors"),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            handle_error: CounterVec::new(
                Opts::new("messageman_handle_errors_total", "Total number of handler callback errors"),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            error: CounterVec::new(
                Opts::new("messageman_errors_total", "Total number of errors outside the job/event path"),
                &["service"],
            )
            .expect("valid metric opts"),
            consumer_gauge: GaugeVec::new(
                Opts::new("messageman_consumer_connected_total", "Number of active consumers"),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            connection_gauge: GaugeVec::new(
                Opts::new("messageman_connection_active_total", "Number of active broker connections"),
                &["service"],
            )
            .expect("valid metric opts"),
            send_duration: HistogramVec::new(
                prometheus::HistogramOpts::new("messageman_jobs_send_duration_seconds", "Send job duration seconds")
                    .buckets(vec![0.01, 0.1, 1.0, 5.0, 10.0]),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            receive_duration: HistogramVec::new(
                prometheus::HistogramOpts::new("messageman_jobs_receive_duration_seconds", "Receive job duration seconds")
                    .buckets(vec![0.01, 0.1, 1.0, 5.0, 10.0, 20.0, 60.0]),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            publish_duration: HistogramVec::new(
                prometheus::HistogramOpts::new("messageman_publish_duration_seconds", "Publish duration seconds")
                    .buckets(vec![0.01, 0.1, 1.0, 5.0, 10.0]),
                &["service", "name"],
            )
            .expect("valid metric opts"),
            handle_duration: HistogramVec::new(
                prometheus::HistogramOpts::new("messageman_handle_duration_seconds", "Subscriber handle duration seconds")
                    .buckets(vec![0.01, 0.1, 1.0, 5.0, 10.0, 20.0, 60.0]),
                &["service", "name"],
            )
            .expect("valid metric opts"),
        };
        Self { registry: OnceLock::new(), vecs }
    }

    fn registry(&self) -> &Registry {
        self.registry.get_or_init(|| {
            let r = Registry::new();
            r.register(Box::new(self.vecs.send_error.clone())).expect("register");
            r.register(Box::new(self.vecs.receive_error.clone())).expect("register");
            r.register(Box::new(self.vecs.publish_error.clone())).expect("register");
            r.register(Box::new(self.vecs.handle_error.clone())).expect("register");
            r.register(Box::new(self.vecs.error.clone())).expect("register");
            r.register(Box::new(self.vecs.consumer_gauge.clone())).expect("register");
            r.register(Box::new(self.vecs.connection_gauge.clone())).expect("register");
            r.register(Box::new(self.vecs.send_duration.clone())).expect("register");
            r.register(Box::new(self.vecs.receive_duration.clone())).expect("register");
            r.register(Box::new(self.vecs.publish_duration.clone())).expect("register");
            r.register(Box::new(self.vecs.handle_duration.clone())).expect("register");
            r
        })
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter for PrometheusExporter {
    fn inc_send_error(&self, l: ServiceNameLabels<'_>) {
        self.vecs.send_error.with_label_values(&[l.service, l.name]).inc();
    }
    fn inc_receive_error(&self, l: ServiceNameLabels<'_>) {
        self.vecs.receive_error.with_label_values(&[l.service, l.name]).inc();
    }
    fn inc_publish_error(&self, l: ServiceNameLabels<'_>) {
        self.vecs.publish_error.with_label_values(&[l.service, l.name]).inc();
    }
    fn inc_handle_error(&self, l: ServiceNameLabels<'_>) {
        self.vecs.handle_error.with_label_values(&[l.service, l.name]).inc();
    }
    fn inc_error(&self, l: ServiceLabels<'_>) {
        self.vecs.error.with_label_values(&[l.service]).inc();
    }
    fn inc_consumer(&self, l: ServiceNameLabels<'_>) {
        self.vecs.consumer_gauge.with_label_values(&[l.service, l.name]).inc();
    }
    fn dec_consumer(&self, l: ServiceNameLabels<'_>) {
        self.vecs.consumer_gauge.with_label_values(&[l.service, l.name]).dec();
    }
    fn inc_connection(&self, l: ServiceLabels<'_>) {
        self.vecs.connection_gauge.with_label_values(&[l.service]).inc();
    }
    fn dec_connection(&self, l: ServiceLabels<'_>) {
        self.vecs.connection_gauge.with_label_values(&[l.service]).dec();
    }
    fn observe_send_seconds(&self, l: ServiceNameLabels<'_>, seconds: f64) {
        self.vecs.send_duration.with_label_values(&[l.service, l.name]).observe(seconds);
    }
    fn observe_receive_seconds(&self, l: ServiceNameLabels<'_>, seconds: f64) {
        self.vecs.receive_duration.with_label_values(&[l.service, l.name]).observe(seconds);
    }
    fn observe_publish_seconds(&self, l: ServiceNameLabels<'_>, seconds: f64) {
        self.vecs.publish_duration.with_label_values(&[l.service, l.name]).observe(seconds);
    }
    fn observe_handle_seconds(&self, l: ServiceNameLabels<'_>, seconds: f64) {
        self.vecs.handle_duration.with_label_values(&[l.service, l.name]).observe(seconds);
    }

    fn gather(&self) -> String {
        let metric_families = self.registry().gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buf) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_exporter_gather_is_empty() {
        let exporter = NilExporter;
        assert_eq!(exporter.gather(), "");
    }

    #[test]
    fn prometheus_exporter_gathers_registered_metrics() {
        let exporter = PrometheusExporter::new();
        exporter.inc_consumer(ServiceNameLabels { service: "svc", name: "q" });
        exporter.inc_connection(ServiceLabels { service: "svc" });
        let out = exporter.gather();
        assert!(out.contains("messageman_consumer_connected_total"));
        assert!(out.contains("messageman_connection_active_total"));
    }

    #[test]
    fn create_exporter_respects_enabled_flag() {
        let exporter = create_exporter(false, "prometheus");
        assert_eq!(exporter.gather(), "");
    }
}
