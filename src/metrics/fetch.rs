//! Fetch phase metrics: downloads, API pages and per-unit failures.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct FetchMetrics;

impl FetchMetrics {
    pub fn record_unit_success(duration_secs: f64, bytes: u64) {
        ::metrics::counter!(phase_metric!(counter, "fetch", "units_success")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "fetch", "unit_duration_seconds"))
            .record(duration_secs);
        ::metrics::histogram!(phase_metric!(histogram, "fetch", "payload_bytes")).record(bytes as f64);
    }

    pub fn record_unit_failed() {
        ::metrics::counter!(phase_metric!(counter, "fetch", "units_failed")).increment(1);
    }

    pub fn record_unit_missing() {
        ::metrics::counter!(phase_metric!(counter, "fetch", "units_missing")).increment(1);
    }

    pub fn record_page(records: usize) {
        ::metrics::counter!(phase_metric!(counter, "fetch", "pages")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "fetch", "page_records")).record(records as f64);
    }

    pub fn record_schema_fallback() {
        ::metrics::counter!(phase_metric!(counter, "fetch", "schema_fallbacks")).increment(1);
    }
}

impl PhaseMetrics for FetchMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "fetch", "units_success"));
        let _ = counter!(phase_metric!(counter, "fetch", "units_failed"));
        let _ = counter!(phase_metric!(counter, "fetch", "units_missing"));
        let _ = counter!(phase_metric!(counter, "fetch", "pages"));
        let _ = counter!(phase_metric!(counter, "fetch", "schema_fallbacks"));
        let _ = histogram!(phase_metric!(histogram, "fetch", "unit_duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "fetch", "payload_bytes"));
        let _ = histogram!(phase_metric!(histogram, "fetch", "page_records"));
    }

    fn phase_name() -> &'static str {
        "fetch"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "fetch", "units_success"),
                metric_type: MetricType::Counter,
                help: "Fetch units (file, series, API batch) that completed",
            },
            MetricDoc {
                name: phase_metric!(counter, "fetch", "units_failed"),
                metric_type: MetricType::Counter,
                help: "Fetch units that failed and were skipped",
            },
            MetricDoc {
                name: phase_metric!(counter, "fetch", "units_missing"),
                metric_type: MetricType::Counter,
                help: "Bulk files that do not exist upstream",
            },
            MetricDoc {
                name: phase_metric!(counter, "fetch", "pages"),
                metric_type: MetricType::Counter,
                help: "Pages requested from paginated APIs",
            },
            MetricDoc {
                name: phase_metric!(counter, "fetch", "schema_fallbacks"),
                metric_type: MetricType::Counter,
                help: "Statistical responses parsed with the secondary schema",
            },
            MetricDoc {
                name: phase_metric!(histogram, "fetch", "unit_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Duration of a fetch unit in seconds",
            },
            MetricDoc {
                name: phase_metric!(histogram, "fetch", "payload_bytes"),
                metric_type: MetricType::Histogram,
                help: "Bytes received per fetch unit",
            },
            MetricDoc {
                name: phase_metric!(histogram, "fetch", "page_records"),
                metric_type: MetricType::Histogram,
                help: "Records returned per API page",
            },
        ]
    }
}
