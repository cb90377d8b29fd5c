//! Phase-organized metrics for the ingestion pipeline
//!
//! Each pipeline phase defines its own metrics in a dedicated submodule so
//! names stay unique and ownership is clear. Recording goes through the
//! `metrics` facade and is a no-op until a recorder is installed.

pub mod fetch;
pub mod load;
pub mod registry;
pub mod transform;

pub use fetch::FetchMetrics;
pub use load::LoadMetrics;
pub use transform::TransformMetrics;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::net::SocketAddr;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register every phase.
///
/// Idempotent. The HTTP listener is only started when `MONEYPLOT_METRICS_ADDR`
/// is set and a Tokio runtime is running; otherwise metrics are kept
/// in-process and can be rendered with [`render`].
pub fn init_metrics() {
    INIT.call_once(|| {
        let mut addr = match std::env::var("MONEYPLOT_METRICS_ADDR") {
            Ok(addr_str) => match addr_str.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Invalid MONEYPLOT_METRICS_ADDR '{}': {}", addr_str, e);
                    None
                }
            },
            Err(_) => None,
        };
        if addr.is_some() && tokio::runtime::Handle::try_current().is_err() {
            warn!("No Tokio runtime, Prometheus HTTP exporter not started");
            addr = None;
        }

        let recorder = match build_recorder(addr) {
            Ok(recorder) => recorder,
            Err(e) => {
                warn!("Failed to build Prometheus recorder: {}", e);
                return;
            }
        };
        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let _ = HANDLE.set(handle);
                registry::register_all_metrics();
            }
            Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
        }
    });
}

/// Build a recorder. With `addr`, its scrape endpoint is spawned on the
/// current runtime before returning.
fn build_recorder(addr: Option<SocketAddr>) -> Result<PrometheusRecorder, BuildError> {
    let builder = PrometheusBuilder::new();
    let Some(addr) = addr else {
        return Ok(builder.build_recorder());
    };

    let (recorder, exporter) = builder.with_http_listener(addr).build()?;
    tokio::spawn(async move {
        // ExporterError implements neither Debug nor Display.
        if exporter.await.is_err() {
            warn!("Prometheus HTTP exporter stopped with an error");
        }
    });
    info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
    Ok(recorder)
}

/// Render the current metrics snapshot in Prometheus text format.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Implemented by each phase's metric collection
pub trait PhaseMetrics {
    /// Register all metrics for this phase
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
}

#[derive(Debug, Clone)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Builds a metric name following `moneyplot_{phase}_{name}[_total]`
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("moneyplot_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("moneyplot_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("moneyplot_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listener_serves_recorded_metrics() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let recorder = build_recorder(Some(addr)).unwrap();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(phase_metric!(counter, "fetch", "units_failed")).increment(2);
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("moneyplot_fetch_units_failed_total 2"), "{response}");
    }

    #[test]
    fn test_recorder_without_listener_renders_in_process() {
        let recorder = build_recorder(None).unwrap();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::gauge!(phase_metric!(gauge, "load", "table_rows")).set(7.0);
        });
        assert!(handle.render().contains("moneyplot_load_table_rows "));
    }

    #[test]
    fn test_metric_naming_convention() {
        assert_eq!(
            phase_metric!(counter, "fetch", "units_failed"),
            "moneyplot_fetch_units_failed_total"
        );
        assert_eq!(
            phase_metric!(histogram, "load", "duration_seconds"),
            "moneyplot_load_duration_seconds"
        );
        assert_eq!(
            phase_metric!(gauge, "load", "table_rows"),
            "moneyplot_load_table_rows"
        );
    }
}
