//! ADEME energy-performance diagnostics (DPE) over the data-fair lines API.
//!
//! The API is offset-paginated: every call asks for `size` rows starting
//! `after` rows in, and a page shorter than requested means there is nothing
//! left. Some filters never return a short page, so each scope also carries a
//! hard offset bound.

use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::config::DpeConfig;
use crate::constants::DPE_COMMUNE_LIMIT;
use crate::error::FetchError;
use crate::metrics::FetchMetrics;
use crate::types::DpeRecord;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

const COMMUNE_FIELD: &str = "code_insee_commune_actualise";

const SELECT_FIELDS: &str = "identifiant_dpe,code_insee_commune_actualise,identifiant_ban,\
classe_consommation_energie,classe_estimation_ges,annee_construction,\
surface_habitable_logement,date_etablissement_dpe";

/// Which slice of the DPE dataset a batch covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DpeScope {
    Commune(String),
    /// Every commune whose INSEE code starts with the department code
    Department(String),
}

impl DpeScope {
    pub fn code(&self) -> &str {
        match self {
            DpeScope::Commune(code) | DpeScope::Department(code) => code,
        }
    }

    /// Whether a diagnostic in `code_commune` belongs to this scope. The
    /// commune query is a full-text match and may return neighbours.
    pub fn contains(&self, code_commune: Option<&str>) -> bool {
        match (self, code_commune) {
            (DpeScope::Commune(code), Some(c)) => c == code,
            (DpeScope::Department(code), Some(c)) => c.starts_with(code.as_str()),
            (_, None) => false,
        }
    }

    fn filter_params(&self) -> Vec<(&'static str, String)> {
        match self {
            DpeScope::Commune(code) => vec![("q_fields", COMMUNE_FIELD.to_string()), ("q", code.clone())],
            DpeScope::Department(code) => vec![("qs", format!("{COMMUNE_FIELD}:{code}*"))],
        }
    }
}

impl fmt::Display for DpeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpeScope::Commune(code) => write!(f, "commune {code}"),
            DpeScope::Department(code) => write!(f, "department {code}"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DpePage {
    #[serde(default)]
    results: Vec<Value>,
}

pub struct DpeClient {
    http: Arc<dyn HttpClientPort>,
    api_url: String,
    page_size: usize,
    max_offset: usize,
}

impl DpeClient {
    pub fn new(http: Arc<dyn HttpClientPort>, config: &DpeConfig) -> Self {
        Self {
            http,
            api_url: config.api_url.clone(),
            page_size: config.page_size.max(1),
            max_offset: config.max_offset,
        }
    }

    /// Page size and offset bound for a scope. Commune queries are capped at
    /// a smaller bound than department sweeps.
    pub fn paging_for(&self, scope: &DpeScope) -> (usize, usize) {
        match scope {
            DpeScope::Commune(_) => {
                let bound = DPE_COMMUNE_LIMIT.min(self.max_offset);
                (self.page_size.min(bound.max(1)), bound)
            }
            DpeScope::Department(_) => (self.page_size, self.max_offset),
        }
    }

    /// Fetch every diagnostic in `scope`. A failing page fails the whole
    /// scope so the caller never replaces a scope with a truncated batch.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn fetch(&self, scope: &DpeScope) -> Result<Vec<DpeRecord>, FetchError> {
        let (page_size, max_offset) = self.paging_for(scope);
        info!("Fetching DPE for {}", scope);

        let t0 = Instant::now();
        let mut records = Vec::new();
        let mut received_bytes = 0u64;
        let mut offset = 0usize;

        while offset < max_offset {
            let mut request = HttpRequest::new(&self.api_url);
            for (key, value) in scope.filter_params() {
                request = request.query(key, value);
            }
            let request = request
                .query("size", page_size)
                .query("after", offset)
                .query("select", SELECT_FIELDS)
                .accept("application/json");

            let response = self.http.get(&request).await?;
            received_bytes += response.bytes.len() as u64;
            let page: DpePage =
                serde_json::from_slice(&response.bytes).map_err(|e| FetchError::Decode {
                    url: request.url.clone(),
                    message: e.to_string(),
                })?;

            let returned = page.results.len();
            FetchMetrics::record_page(returned);
            debug!("DPE page at offset {} returned {} rows", offset, returned);
            if returned == 0 {
                break;
            }

            records.extend(page.results.iter().map(map_record));
            offset += returned;
            if returned < page_size {
                break;
            }
        }

        FetchMetrics::record_unit_success(t0.elapsed().as_secs_f64(), received_bytes);
        info!("Fetched {} DPE records for {}", records.len(), scope);
        Ok(records)
    }
}

/// Drop repeated diagnostics within one batch, keeping the first occurrence
/// of each `id_dpe`. Rows without an identifier are all kept.
pub fn dedupe_by_id(records: Vec<DpeRecord>) -> Vec<DpeRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| match &r.id_dpe {
            Some(id) => seen.insert(id.clone()),
            None => true,
        })
        .collect()
}

/// Map one API row. Fields that are missing or do not parse become `None`.
pub fn map_record(row: &Value) -> DpeRecord {
    DpeRecord {
        id_dpe: text_field(row, "identifiant_dpe"),
        code_commune: text_field(row, COMMUNE_FIELD),
        // No parcel identifier in the DPE dataset
        id_parcelle: None,
        classe_energie: text_field(row, "classe_consommation_energie"),
        classe_ges: text_field(row, "classe_estimation_ges"),
        annee_construction: row.get("annee_construction").and_then(safe_int),
        surface_habitable: row.get("surface_habitable_logement").and_then(safe_float),
        date_etablissement: row.get("date_etablissement_dpe").and_then(safe_date),
    }
}

fn text_field(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn safe_int(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .and_then(|i| i32::try_from(i).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

fn safe_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Dates arrive as `YYYY-MM-DD`, sometimes with a time part appended.
fn safe_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{DownloadStatus, HttpGetResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;

    /// Answers every page with `full_pages` full pages, then a short one.
    struct PagingHttp {
        full_pages: usize,
        short_len: usize,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl PagingHttp {
        fn new(full_pages: usize, short_len: usize) -> Self {
            Self {
                full_pages,
                short_len,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpClientPort for PagingHttp {
        async fn get(&self, request: &HttpRequest) -> Result<HttpGetResult, FetchError> {
            let call = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            let size: usize = request.query_value("size").unwrap().parse().unwrap();
            let len = if call <= self.full_pages { size } else { self.short_len };
            let rows: Vec<Value> = (0..len)
                .map(|i| {
                    json!({
                        "identifiant_dpe": format!("DPE{call}-{i}"),
                        "code_insee_commune_actualise": "75056",
                        "classe_consommation_energie": "D",
                        "surface_habitable_logement": 50.0,
                        "date_etablissement_dpe": "2023-04-01"
                    })
                })
                .collect();
            Ok(HttpGetResult {
                status: 200,
                bytes: serde_json::to_vec(&json!({ "results": rows })).unwrap(),
                content_type: "application/json".into(),
            })
        }

        async fn download(&self, _url: &str, _dest: &Path) -> Result<DownloadStatus, FetchError> {
            Ok(DownloadStatus::NotFound)
        }
    }

    fn client(http: Arc<PagingHttp>, page_size: usize, max_offset: usize) -> DpeClient {
        let config = DpeConfig {
            page_size,
            max_offset,
            ..DpeConfig::default()
        };
        DpeClient::new(http, &config)
    }

    #[tokio::test]
    async fn test_full_pages_stop_at_max_offset() {
        let http = Arc::new(PagingHttp::new(usize::MAX, 0));
        let dpe = client(http.clone(), 100, 500);

        let records = dpe.fetch(&DpeScope::Department("75".into())).await.unwrap();

        assert_eq!(http.calls(), 5);
        assert_eq!(records.len(), 500);
        let offsets: Vec<String> = http
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.query_value("after").unwrap().to_string())
            .collect();
        assert_eq!(offsets, vec!["0", "100", "200", "300", "400"]);
    }

    #[tokio::test]
    async fn test_short_page_ends_pagination() {
        let http = Arc::new(PagingHttp::new(2, 37));
        let dpe = client(http.clone(), 100, 10_000);

        let records = dpe.fetch(&DpeScope::Department("13".into())).await.unwrap();

        assert_eq!(http.calls(), 3);
        assert_eq!(records.len(), 237);
    }

    #[tokio::test]
    async fn test_empty_first_page() {
        let http = Arc::new(PagingHttp::new(0, 0));
        let dpe = client(http.clone(), 100, 10_000);

        let records = dpe.fetch(&DpeScope::Commune("75056".into())).await.unwrap();

        assert!(records.is_empty());
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn test_scope_query_parameters() {
        let http = Arc::new(PagingHttp::new(0, 1));
        let dpe = client(http.clone(), 1000, 100_000);

        dpe.fetch(&DpeScope::Commune("69123".into())).await.unwrap();
        dpe.fetch(&DpeScope::Department("2A".into())).await.unwrap();

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[0].query_value("q_fields"), Some(COMMUNE_FIELD));
        assert_eq!(requests[0].query_value("q"), Some("69123"));
        assert_eq!(requests[0].query_value("qs"), None);
        assert_eq!(
            requests[1].query_value("qs"),
            Some("code_insee_commune_actualise:2A*")
        );
        assert_eq!(requests[1].query_value("size"), Some("1000"));
    }

    #[test]
    fn test_commune_paging_is_capped() {
        let http = Arc::new(PagingHttp::new(0, 0));
        let dpe = client(http, 1000, 100_000);
        assert_eq!(dpe.paging_for(&DpeScope::Commune("1".into())), (1000, 10_000));
        assert_eq!(dpe.paging_for(&DpeScope::Department("1".into())), (1000, 100_000));
    }

    #[test]
    fn test_map_record_tolerates_bad_fields() {
        let row = json!({
            "identifiant_dpe": "2375E0123456X",
            "code_insee_commune_actualise": "75056",
            "classe_consommation_energie": "C",
            "classe_estimation_ges": "",
            "annee_construction": "avant 1948",
            "surface_habitable_logement": "n/a",
            "date_etablissement_dpe": "2022-13-45"
        });
        let record = map_record(&row);
        assert_eq!(record.id_dpe.as_deref(), Some("2375E0123456X"));
        assert_eq!(record.classe_energie.as_deref(), Some("C"));
        assert_eq!(record.classe_ges, None);
        assert_eq!(record.annee_construction, None);
        assert_eq!(record.surface_habitable, None);
        assert_eq!(record.date_etablissement, None);
        assert_eq!(record.id_parcelle, None);
    }

    #[test]
    fn test_dedupe_by_id() {
        let rows: Vec<DpeRecord> = [Some("a"), Some("b"), Some("a"), None, None]
            .into_iter()
            .map(|id| DpeRecord {
                id_dpe: id.map(str::to_string),
                ..map_record(&json!({}))
            })
            .collect();
        assert_eq!(dedupe_by_id(rows).len(), 4);
    }

    #[test]
    fn test_map_record_numeric_strings() {
        let row = json!({
            "annee_construction": "1975",
            "surface_habitable_logement": "48.5",
            "date_etablissement_dpe": "2021-07-01T00:00:00"
        });
        let record = map_record(&row);
        assert_eq!(record.annee_construction, Some(1975));
        assert_eq!(record.surface_habitable, Some(48.5));
        assert_eq!(record.date_etablissement, NaiveDate::from_ymd_opt(2021, 7, 1));
    }
}
