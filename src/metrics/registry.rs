//! Registers every phase and detects naming conflicts early.

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{info, warn};

pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::fetch::FetchMetrics>(&mut all_metrics);
    register_phase_metrics::<super::transform::TransformMetrics>(&mut all_metrics);
    register_phase_metrics::<super::load::LoadMetrics>(&mut all_metrics);

    info!("Registered {} metrics across all phases", all_metrics.len());
}

fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<&'static str, MetricDoc>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        if all_metrics.contains_key(doc.name) {
            warn!(
                "Metric name conflict: '{}' registered again by phase '{}'",
                doc.name, phase_name
            );
        } else {
            all_metrics.insert(doc.name, doc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{FetchMetrics, LoadMetrics, TransformMetrics};
    use std::collections::HashSet;

    #[test]
    fn test_no_duplicate_names_across_phases() {
        let mut seen = HashSet::new();
        let docs = FetchMetrics::metrics_documentation()
            .into_iter()
            .chain(TransformMetrics::metrics_documentation())
            .chain(LoadMetrics::metrics_documentation());
        for doc in docs {
            assert!(seen.insert(doc.name), "duplicate metric {}", doc.name);
        }
    }
}
