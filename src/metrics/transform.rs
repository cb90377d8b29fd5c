//! Transform phase metrics: cleaning and enrichment.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct TransformMetrics;

impl TransformMetrics {
    pub fn record_clean(raw_rows: usize, dropped_rows: usize, output_rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "transform", "raw_rows")).increment(raw_rows as u64);
        ::metrics::counter!(phase_metric!(counter, "transform", "dropped_rows"))
            .increment(dropped_rows as u64);
        ::metrics::gauge!(phase_metric!(gauge, "transform", "canonical_rows")).set(output_rows as f64);
    }

    pub fn record_unreadable_file() {
        ::metrics::counter!(phase_metric!(counter, "transform", "unreadable_files")).increment(1);
    }

    pub fn record_enrichment(total: usize, matched: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "transform", "enriched_rows")).set(total as f64);
        ::metrics::gauge!(phase_metric!(gauge, "transform", "enriched_matched_rows")).set(matched as f64);
    }
}

impl PhaseMetrics for TransformMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge};

        let _ = counter!(phase_metric!(counter, "transform", "raw_rows"));
        let _ = counter!(phase_metric!(counter, "transform", "dropped_rows"));
        let _ = counter!(phase_metric!(counter, "transform", "unreadable_files"));
        let _ = gauge!(phase_metric!(gauge, "transform", "canonical_rows"));
        let _ = gauge!(phase_metric!(gauge, "transform", "enriched_rows"));
        let _ = gauge!(phase_metric!(gauge, "transform", "enriched_matched_rows"));
    }

    fn phase_name() -> &'static str {
        "transform"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "transform", "raw_rows"),
                metric_type: MetricType::Counter,
                help: "Raw rows read from staged files",
            },
            MetricDoc {
                name: phase_metric!(counter, "transform", "dropped_rows"),
                metric_type: MetricType::Counter,
                help: "Raw rows rejected by filters or deduplication",
            },
            MetricDoc {
                name: phase_metric!(counter, "transform", "unreadable_files"),
                metric_type: MetricType::Counter,
                help: "Staged files skipped because they could not be read",
            },
            MetricDoc {
                name: phase_metric!(gauge, "transform", "canonical_rows"),
                metric_type: MetricType::Gauge,
                help: "Rows in the last canonical artifact",
            },
            MetricDoc {
                name: phase_metric!(gauge, "transform", "enriched_rows"),
                metric_type: MetricType::Gauge,
                help: "Rows in the last enrichment output",
            },
            MetricDoc {
                name: phase_metric!(gauge, "transform", "enriched_matched_rows"),
                metric_type: MetricType::Gauge,
                help: "Enriched rows that found an energy rating",
            },
        ]
    }
}
