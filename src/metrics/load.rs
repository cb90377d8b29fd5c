//! Load phase metrics: table replacements into the destination store.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct LoadMetrics;

impl LoadMetrics {
    pub fn record_replace(rows: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "load", "replacements")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "load", "duration_seconds")).record(duration_secs);
        ::metrics::histogram!(phase_metric!(histogram, "load", "rows")).record(rows as f64);
    }

    pub fn record_failure() {
        ::metrics::counter!(phase_metric!(counter, "load", "failures")).increment(1);
    }

    pub fn record_empty_skipped() {
        ::metrics::counter!(phase_metric!(counter, "load", "empty_skipped")).increment(1);
    }
}

impl PhaseMetrics for LoadMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "load", "replacements"));
        let _ = counter!(phase_metric!(counter, "load", "failures"));
        let _ = counter!(phase_metric!(counter, "load", "empty_skipped"));
        let _ = histogram!(phase_metric!(histogram, "load", "duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "load", "rows"));
    }

    fn phase_name() -> &'static str {
        "load"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "load", "replacements"),
                metric_type: MetricType::Counter,
                help: "Completed table replacements",
            },
            MetricDoc {
                name: phase_metric!(counter, "load", "failures"),
                metric_type: MetricType::Counter,
                help: "Table replacements that failed and were rolled back",
            },
            MetricDoc {
                name: phase_metric!(counter, "load", "empty_skipped"),
                metric_type: MetricType::Counter,
                help: "Empty loads that left a populated table untouched",
            },
            MetricDoc {
                name: phase_metric!(histogram, "load", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Duration of a table replacement in seconds",
            },
            MetricDoc {
                name: phase_metric!(histogram, "load", "rows"),
                metric_type: MetricType::Histogram,
                help: "Rows written per table replacement",
            },
        ]
    }
}
