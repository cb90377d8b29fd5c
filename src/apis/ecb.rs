//! Monthly French mortgage rates from the ECB data API (MFI interest rates).

use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::config::EcbConfig;
use crate::constants::ECB_SOURCE;
use crate::error::Result;
use crate::metrics::FetchMetrics;
use crate::types::MortgageRatePoint;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

pub struct EcbClient {
    http: Arc<dyn HttpClientPort>,
    api_url: String,
    series_key: String,
}

impl EcbClient {
    pub fn new(http: Arc<dyn HttpClientPort>, config: &EcbConfig) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            series_key: config.series_key.clone(),
        }
    }

    pub fn series_url(&self) -> String {
        format!("{}/{}", self.api_url, self.series_key)
    }

    #[instrument(skip(self), fields(series = %self.series_key))]
    pub async fn fetch_mortgage_rates(&self) -> Result<Vec<MortgageRatePoint>> {
        info!("Fetching ECB mortgage rates: {}", self.series_key);
        let request = HttpRequest::new(self.series_url())
            .query("format", "csvdata")
            .accept("text/csv");

        let t0 = Instant::now();
        let response = self.http.get(&request).await?;
        let rates = parse_ecb_csv(&response.bytes)?;
        FetchMetrics::record_unit_success(t0.elapsed().as_secs_f64(), response.bytes.len() as u64);

        info!("Fetched {} mortgage rate data points", rates.len());
        Ok(rates)
    }
}

/// ECB periods are monthly (`2024-03`); daily dates are accepted too.
pub fn parse_period(period: &str) -> Option<NaiveDate> {
    let period = period.trim();
    NaiveDate::parse_from_str(period, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("{period}-01"), "%Y-%m-%d").ok())
}

/// Parse the `csvdata` body. Rows whose period or value does not parse are
/// dropped; a body without `TIME_PERIOD`/`OBS_VALUE` columns yields nothing.
pub fn parse_ecb_csv(body: &[u8]) -> Result<Vec<MortgageRatePoint>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(body);
    let headers = reader.headers()?.clone();

    let position = |name: &str| headers.iter().position(|h| h.trim() == name);
    let (Some(period_idx), Some(value_idx)) = (position("TIME_PERIOD"), position("OBS_VALUE")) else {
        warn!(
            "Unexpected ECB response format: {:?}",
            headers.iter().collect::<Vec<_>>()
        );
        return Ok(Vec::new());
    };

    let mut rates = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else { continue };
        let date = record.get(period_idx).and_then(parse_period);
        let taux = record
            .get(value_idx)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite());
        if let (Some(date), Some(taux)) = (date, taux) {
            rates.push(MortgageRatePoint {
                date,
                taux,
                source: ECB_SOURCE.to_string(),
            });
        }
    }
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{DownloadStatus, HttpGetResult};
    use crate::error::FetchError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    const BODY: &str = "KEY,FREQ,REF_AREA,TIME_PERIOD,OBS_VALUE,OBS_STATUS\n\
M.FR.B.A2C.A.C.A.2250.EUR.N,M,FR,2024-01,3.91,A\n\
M.FR.B.A2C.A.C.A.2250.EUR.N,M,FR,2024-02,3.85,A\n\
M.FR.B.A2C.A.C.A.2250.EUR.N,M,FR,2024-03,,M\n\
M.FR.B.A2C.A.C.A.2250.EUR.N,M,FR,not-a-date,3.70,A\n";

    #[test]
    fn test_parse_csvdata() {
        let rates = parse_ecb_csv(BODY.as_bytes()).unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(rates[0].taux, 3.91);
        assert_eq!(rates[1].source, "ECB");
    }

    #[test]
    fn test_missing_columns_yield_empty() {
        let rates = parse_ecb_csv(b"DATE,RATE\n2024-01,3.9\n").unwrap();
        assert!(rates.is_empty());
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("2023-11"), NaiveDate::from_ymd_opt(2023, 11, 1));
        assert_eq!(parse_period("2023-11-15"), NaiveDate::from_ymd_opt(2023, 11, 15));
        assert_eq!(parse_period("2023-Q1"), None);
    }

    struct CsvHttp {
        seen: Mutex<Option<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClientPort for CsvHttp {
        async fn get(&self, request: &HttpRequest) -> std::result::Result<HttpGetResult, FetchError> {
            *self.seen.lock().unwrap() = Some(request.clone());
            Ok(HttpGetResult {
                status: 200,
                bytes: BODY.as_bytes().to_vec(),
                content_type: "text/csv".into(),
            })
        }

        async fn download(&self, _url: &str, _dest: &Path) -> std::result::Result<DownloadStatus, FetchError> {
            Ok(DownloadStatus::NotFound)
        }
    }

    #[tokio::test]
    async fn test_fetch_requests_csvdata() {
        let http = Arc::new(CsvHttp { seen: Mutex::new(None) });
        let client = EcbClient::new(http.clone(), &EcbConfig::default());

        let rates = client.fetch_mortgage_rates().await.unwrap();

        assert_eq!(rates.len(), 2);
        let seen = http.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.query_value("format"), Some("csvdata"));
        assert!(seen.url.ends_with("/MIR/M.FR.B.A2C.A.C.A.2250.EUR.N"));
    }
}
