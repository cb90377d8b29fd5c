//! Notaires-INSEE price indices from the INSEE BDM SDMX-ML endpoint.

use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::config::{InseeConfig, SeriesLabel};
use crate::error::{PipelineError, Result};
use crate::metrics::FetchMetrics;
use crate::types::PriceIndexPoint;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

static QUARTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-[QT]([1-4])$").expect("valid quarter regex"));

/// `2023-Q1` or `2023-T1` to the first day of that quarter.
pub fn quarter_to_date(period: &str) -> Option<NaiveDate> {
    let caps = QUARTER_RE.captures(period.trim())?;
    let year: i32 = caps[1].parse().ok()?;
    let quarter: u32 = caps[2].parse().ok()?;
    NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1)
}

/// The two SDMX-ML message shapes INSEE may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdmxLayout {
    /// `<Obs TIME_PERIOD=".." OBS_VALUE=".."/>`
    StructureSpecific,
    /// `<Obs><ObsDimension value=".."/><ObsValue value=".."/></Obs>`
    Generic,
}

impl SdmxLayout {
    /// Tried in this order; the next layout is used only when the previous
    /// one produced no observations.
    pub const PRIORITY: [SdmxLayout; 2] = [SdmxLayout::StructureSpecific, SdmxLayout::Generic];

    /// Raw `(period, value)` pairs found under this layout.
    pub fn observations(self, xml: &str) -> Result<Vec<(String, String)>> {
        match self {
            SdmxLayout::StructureSpecific => structure_specific_observations(xml),
            SdmxLayout::Generic => generic_observations(xml),
        }
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn xml_error(e: quick_xml::Error) -> PipelineError {
    PipelineError::Parse(format!("SDMX-ML: {e}"))
}

fn structure_specific_observations(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Obs" => {
                if let (Some(period), Some(value)) =
                    (attribute(&e, b"TIME_PERIOD"), attribute(&e, b"OBS_VALUE"))
                {
                    out.push((period, value));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn generic_observations(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut in_obs = false;
    let mut period: Option<String> = None;
    let mut value: Option<String> = None;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) if e.local_name().as_ref() == b"Obs" => {
                in_obs = true;
                period = None;
                value = None;
            }
            Event::Start(e) | Event::Empty(e) if in_obs => match e.local_name().as_ref() {
                b"ObsDimension" => period = attribute(&e, b"value").or(period),
                b"ObsValue" => value = attribute(&e, b"value").or(value),
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"Obs" => {
                in_obs = false;
                if let (Some(p), Some(v)) = (period.take(), value.take()) {
                    out.push((p, v));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn to_points(raw: Vec<(String, String)>, label: &SeriesLabel) -> Vec<PriceIndexPoint> {
    raw.into_iter()
        .filter_map(|(period, value)| {
            let date = quarter_to_date(&period)?;
            let indice = value.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
            Some(PriceIndexPoint {
                date,
                indice,
                type_bien: label.type_bien.clone(),
                zone: label.zone.clone(),
            })
        })
        .collect()
}

/// Parse one SDMX-ML series document. Callers never learn which layout matched.
pub fn parse_sdmx(xml: &str, label: &SeriesLabel) -> Result<Vec<PriceIndexPoint>> {
    for (attempt, layout) in SdmxLayout::PRIORITY.iter().enumerate() {
        let points = to_points(layout.observations(xml)?, label);
        if !points.is_empty() {
            if attempt > 0 {
                FetchMetrics::record_schema_fallback();
                debug!("Parsed {} observations with {:?} layout", points.len(), layout);
            }
            return Ok(points);
        }
    }
    Ok(Vec::new())
}

#[derive(Debug, Default)]
pub struct PriceIndexReport {
    pub points: Vec<PriceIndexPoint>,
    pub failed_series: Vec<String>,
}

pub struct InseeClient {
    http: Arc<dyn HttpClientPort>,
    api_url: String,
    series: Vec<(String, SeriesLabel)>,
}

impl InseeClient {
    pub fn new(http: Arc<dyn HttpClientPort>, config: &InseeConfig) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            series: config
                .series
                .iter()
                .map(|(id, label)| (id.clone(), label.clone()))
                .collect(),
        }
    }

    #[instrument(skip(self, label))]
    pub async fn fetch_series(&self, series_id: &str, label: &SeriesLabel) -> Result<Vec<PriceIndexPoint>> {
        let request = HttpRequest::new(format!("{}/{}", self.api_url, series_id)).accept("application/xml");
        let t0 = Instant::now();
        let response = self.http.get(&request).await?;
        let points = parse_sdmx(&response.text(), label)?;
        FetchMetrics::record_unit_success(t0.elapsed().as_secs_f64(), response.bytes.len() as u64);
        Ok(points)
    }

    /// Fetch every configured series. A failing series is logged and left
    /// out; the others are still returned.
    #[instrument(skip(self))]
    pub async fn fetch_price_indices(&self) -> PriceIndexReport {
        let mut report = PriceIndexReport::default();
        for (series_id, label) in &self.series {
            info!("Fetching INSEE series {} ({}, {})", series_id, label.type_bien, label.zone);
            match self.fetch_series(series_id, label).await {
                Ok(points) => {
                    info!("Series {}: {} observations", series_id, points.len());
                    report.points.extend(points);
                }
                Err(e) => {
                    FetchMetrics::record_unit_failed();
                    error!("Failed to fetch series {}: {}", series_id, e);
                    report.failed_series.push(series_id.clone());
                }
            }
        }
        info!("Fetched {} price index data points", report.points.len());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{DownloadStatus, HttpGetResult};
    use crate::error::FetchError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;

    const STRUCTURE_SPECIFIC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<message:StructureSpecificData xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message">
  <message:DataSet>
    <Series IDBANK="010567006" FREQ="T">
      <Obs TIME_PERIOD="2023-Q4" OBS_VALUE="118.4" OBS_STATUS="A"/>
      <Obs TIME_PERIOD="2023-Q3" OBS_VALUE="120.1" OBS_STATUS="A"/>
      <Obs TIME_PERIOD="2023-Q2" OBS_VALUE="NaN" OBS_STATUS="O"/>
    </Series>
  </message:DataSet>
</message:StructureSpecificData>"#;

    const GENERIC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<message:GenericData xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message"
    xmlns:generic="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/data/generic">
  <message:DataSet>
    <generic:Series>
      <generic:Obs>
        <generic:ObsDimension value="2022-T1"/>
        <generic:ObsValue value="110.0"/>
      </generic:Obs>
      <generic:Obs>
        <generic:ObsDimension value="2022-T2"/>
        <generic:ObsValue value="111.5"/>
      </generic:Obs>
      <generic:Obs>
        <generic:ObsDimension value="2022-T3"/>
        <generic:ObsValue value="112.25"/>
      </generic:Obs>
      <generic:Obs>
        <generic:ObsDimension value="2022-T4"/>
        <generic:ObsValue value="113.0"/>
      </generic:Obs>
    </generic:Series>
  </message:DataSet>
</message:GenericData>"#;

    fn label() -> SeriesLabel {
        SeriesLabel {
            type_bien: "Appartements".into(),
            zone: "France".into(),
        }
    }

    #[test]
    fn test_quarter_to_date() {
        assert_eq!(quarter_to_date("2023-Q1"), NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(quarter_to_date("2023-T3"), NaiveDate::from_ymd_opt(2023, 7, 1));
        assert_eq!(quarter_to_date("2023-Q4"), NaiveDate::from_ymd_opt(2023, 10, 1));
        assert_eq!(quarter_to_date("2023-Q5"), None);
        assert_eq!(quarter_to_date("2023-03"), None);
        assert_eq!(quarter_to_date("garbage"), None);
    }

    #[test]
    fn test_structure_specific_layout() {
        let points = parse_sdmx(STRUCTURE_SPECIFIC, &label()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2023, 10, 1).unwrap());
        assert_eq!(points[0].indice, 118.4);
        assert_eq!(points[0].type_bien, "Appartements");
        assert_eq!(points[0].zone, "France");
    }

    #[test]
    fn test_falls_back_to_generic_layout() {
        assert!(SdmxLayout::StructureSpecific.observations(GENERIC).unwrap().is_empty());

        let points = parse_sdmx(GENERIC, &label()).unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());
        assert_eq!(points[3].date, NaiveDate::from_ymd_opt(2022, 10, 1).unwrap());
        assert_eq!(points[2].indice, 112.25);
    }

    #[test]
    fn test_no_observations_is_empty_not_error() {
        let xml = r#"<message:GenericData xmlns:message="m"><message:DataSet/></message:GenericData>"#;
        assert!(parse_sdmx(xml, &label()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_xml_is_parse_error() {
        let err = parse_sdmx("<a><b></a>", &label()).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
    }

    /// Serves the generic layout for one series and fails the other.
    struct SeriesHttp;

    #[async_trait]
    impl HttpClientPort for SeriesHttp {
        async fn get(&self, request: &HttpRequest) -> std::result::Result<HttpGetResult, FetchError> {
            if request.url.ends_with("/010567006") {
                Ok(HttpGetResult {
                    status: 200,
                    bytes: GENERIC.as_bytes().to_vec(),
                    content_type: "application/xml".into(),
                })
            } else {
                Err(FetchError::Status {
                    url: request.url.clone(),
                    status: 500,
                })
            }
        }

        async fn download(&self, _url: &str, _dest: &Path) -> std::result::Result<DownloadStatus, FetchError> {
            Ok(DownloadStatus::NotFound)
        }
    }

    #[tokio::test]
    async fn test_failing_series_is_skipped() {
        let mut series = BTreeMap::new();
        series.insert("010567006".to_string(), label());
        series.insert(
            "010567007".to_string(),
            SeriesLabel {
                type_bien: "Maisons".into(),
                zone: "France".into(),
            },
        );
        let config = InseeConfig {
            api_url: "https://insee.test/series/".into(),
            series,
        };
        let client = InseeClient::new(Arc::new(SeriesHttp), &config);

        let report = client.fetch_price_indices().await;

        assert_eq!(report.points.len(), 4);
        assert_eq!(report.failed_series, vec!["010567007".to_string()]);
    }
}
