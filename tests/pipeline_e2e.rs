use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use moneyplot::apis::dpe::DpeScope;
use moneyplot::app::ports::{DownloadStatus, HttpClientPort, HttpGetResult, HttpRequest};
use moneyplot::config::{Config, SeriesLabel};
use moneyplot::error::FetchError;
use moneyplot::pipeline::materialize::MetadataValue;
use moneyplot::pipeline::storage::Store;
use moneyplot::pipeline::{Materializer, PipelineContext, Step, UpstreamPolicy};
use moneyplot::types::{DpeRecord, EnrichedMutation, Mutation};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const DVF_URL: &str = "http://dvf.test/csv";
const DPE_URL: &str = "http://dpe.test/lines";
const INSEE_URL: &str = "http://insee.test/data";
const ECB_URL: &str = "http://ecb.test/data";

const DVF_HEADER: &str = "id_mutation,date_mutation,numero_disposition,nature_mutation,valeur_fonciere,\
code_postal,code_commune,nom_commune,code_departement,id_parcelle,type_local,\
surface_reelle_bati,nombre_pieces_principales,surface_terrain,longitude,latitude";

const STRUCTURE_SPECIFIC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<message:StructureSpecificData xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message">
  <message:DataSet>
    <Series IDBANK="010567006">
      <Obs TIME_PERIOD="2023-Q3" OBS_VALUE="120.1"/>
      <Obs TIME_PERIOD="2023-Q4" OBS_VALUE="118.4"/>
    </Series>
  </message:DataSet>
</message:StructureSpecificData>"#;

const GENERIC_ONLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<message:GenericData xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message"
    xmlns:generic="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/data/generic">
  <message:DataSet>
    <generic:Series>
      <generic:Obs><generic:ObsDimension value="2022-T1"/><generic:ObsValue value="110.0"/></generic:Obs>
      <generic:Obs><generic:ObsDimension value="2022-T2"/><generic:ObsValue value="111.5"/></generic:Obs>
      <generic:Obs><generic:ObsDimension value="2022-T3"/><generic:ObsValue value="112.25"/></generic:Obs>
      <generic:Obs><generic:ObsDimension value="2022-T4"/><generic:ObsValue value="113.0"/></generic:Obs>
    </generic:Series>
  </message:DataSet>
</message:GenericData>"#;

const ECB_BODY: &str = "KEY,FREQ,REF_AREA,TIME_PERIOD,OBS_VALUE\n\
M.FR.B.A2C.A.C.A.2250.EUR.N,M,FR,2024-01,3.91\n\
M.FR.B.A2C.A.C.A.2250.EUR.N,M,FR,2024-02,3.85\n";

fn gzip(body: &str) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body.as_bytes()).unwrap();
    enc.finish().unwrap()
}

fn dvf_file() -> Vec<u8> {
    let rows = [
        // same mutation, two surfaces: the larger one survives
        "2023-1,2023-08-14,1,Vente,300000,75011,75111,Paris 11e,75,75111000AB0001,Appartement,45,2,,2.37,48.86",
        "2023-1,2023-08-14,1,Vente,300000,75011,75111,Paris 11e,75,75111000AB0001,Appartement,50,2,,2.37,48.86",
        // above the price bound
        "2023-2,2023-09-01,1,Vente,15000000,75011,75111,Paris 11e,75,75111000AB0002,Appartement,400,8,,2.37,48.86",
        "2023-3,2023-10-02,1,Vente,650000,75011,75111,Paris 11e,75,75111000AB0003,Maison,120,5,210,2.38,48.85",
        // not a sale
        "2023-4,2023-10-03,1,Echange,120000,75011,75111,Paris 11e,75,75111000AB0004,Maison,80,4,,2.38,48.85",
    ];
    gzip(&format!("{}\n{}\n", DVF_HEADER, rows.join("\n")))
}

fn dpe_rows() -> Vec<Value> {
    vec![
        json!({
            "identifiant_dpe": "2375E0001",
            "code_insee_commune_actualise": "75111",
            "classe_consommation_energie": "C",
            "classe_estimation_ges": "B",
            "annee_construction": 1972,
            "surface_habitable_logement": 52.0,
            "date_etablissement_dpe": "2023-02-10"
        }),
        json!({
            "identifiant_dpe": "2375E0002",
            "code_insee_commune_actualise": "75111",
            "classe_consommation_energie": "F",
            "surface_habitable_logement": "300",
            "date_etablissement_dpe": "2021-06-30"
        }),
    ]
}

/// Serves every upstream from memory. DPE department `13` always fails.
struct FakeSources {
    downloads: Mutex<Vec<String>>,
    dvf_files: HashMap<String, Vec<u8>>,
}

impl FakeSources {
    fn new() -> Self {
        let mut dvf_files = HashMap::new();
        dvf_files.insert(format!("{DVF_URL}/2023/departements/75.csv.gz"), dvf_file());
        Self {
            downloads: Mutex::new(Vec::new()),
            dvf_files,
        }
    }

    fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    fn ok(body: impl Into<Vec<u8>>) -> Result<HttpGetResult, FetchError> {
        Ok(HttpGetResult {
            status: 200,
            bytes: body.into(),
            content_type: String::new(),
        })
    }

    fn status(url: &str, status: u16) -> Result<HttpGetResult, FetchError> {
        Err(FetchError::Status {
            url: url.to_string(),
            status,
        })
    }
}

#[async_trait]
impl HttpClientPort for FakeSources {
    async fn get(&self, request: &HttpRequest) -> Result<HttpGetResult, FetchError> {
        let url = request.url.as_str();
        if url == DPE_URL {
            if request.query_value("qs").is_some_and(|qs| qs.contains(":13")) {
                return Self::status(url, 503);
            }
            let after: usize = request.query_value("after").unwrap_or("0").parse().unwrap();
            let commune = request.query_value("q").unwrap_or_default();
            let results: Vec<Value> = if after == 0 {
                dpe_rows()
                    .into_iter()
                    .filter(|r| r["code_insee_commune_actualise"] == commune)
                    .collect()
            } else {
                Vec::new()
            };
            return Self::ok(serde_json::to_vec(&json!({ "results": results })).unwrap());
        }
        if let Some(series) = url.strip_prefix(&format!("{INSEE_URL}/")) {
            return match series {
                "010567006" => Self::ok(STRUCTURE_SPECIFIC),
                "010567007" => Self::ok(GENERIC_ONLY),
                _ => Self::status(url, 404),
            };
        }
        if url.starts_with(ECB_URL) {
            return Self::ok(ECB_BODY);
        }
        Self::status(url, 404)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<DownloadStatus, FetchError> {
        self.downloads.lock().unwrap().push(url.to_string());
        match self.dvf_files.get(url) {
            Some(bytes) => {
                std::fs::create_dir_all(dest.parent().unwrap())?;
                std::fs::write(dest, bytes)?;
                Ok(DownloadStatus::Complete {
                    bytes: bytes.len() as u64,
                })
            }
            None => Ok(DownloadStatus::NotFound),
        }
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::with_data_root(root);
    config.dvf.base_url = DVF_URL.to_string();
    config.dvf.years = vec!["2023".to_string()];
    config.dvf.departments = vec!["75".to_string(), "2A".to_string()];
    config.dpe.api_url = DPE_URL.to_string();
    config.dpe.communes = vec!["75111".to_string()];
    config.dpe.departments = vec!["13".to_string()];
    config.insee.api_url = INSEE_URL.to_string();
    config.insee.series = BTreeMap::from([
        (
            "010567006".to_string(),
            SeriesLabel {
                type_bien: "Appartements".into(),
                zone: "France".into(),
            },
        ),
        (
            "010567007".to_string(),
            SeriesLabel {
                type_bien: "Maisons".into(),
                zone: "France".into(),
            },
        ),
    ]);
    config.ecb.api_url = ECB_URL.to_string();
    config
}

fn setup() -> (TempDir, Arc<FakeSources>, Materializer) {
    let dir = tempdir().unwrap();
    let fake = Arc::new(FakeSources::new());
    let ctx = PipelineContext::new(test_config(dir.path()), fake.clone());
    (dir, fake, Materializer::new(ctx))
}

fn open_store(materializer: &Materializer) -> Store {
    materializer.context().stores.open().unwrap()
}

#[tokio::test]
async fn test_run_all_materializes_every_table() {
    let (_dir, fake, materializer) = setup();

    let report = materializer.run_all().await;

    assert!(report.success(), "failures: {:?}", report.failures);
    assert_eq!(report.runs.len(), Step::ALL.len());
    assert_eq!(fake.download_count(), 2);

    let store = open_store(&materializer);
    let mut mutations: Vec<Mutation> = store.read_all().unwrap();
    mutations.sort_by(|a, b| a.id_mutation.cmp(&b.id_mutation));
    let ids: Vec<&str> = mutations.iter().map(|m| m.id_mutation.as_str()).collect();
    assert_eq!(ids, vec!["2023-1", "2023-3"]);
    assert_eq!(mutations[0].surface_reelle_bati, Some(50.0));
    assert_eq!(mutations[0].prix_m2, Some(6000.0));

    // two structure-specific observations plus four from the generic fallback
    assert_eq!(store.count("indices_prix").unwrap(), 6);
    assert_eq!(store.count("taux_hypothecaires").unwrap(), 2);
    assert_eq!(store.count("dpe").unwrap(), 2);

    let enriched: Vec<EnrichedMutation> = store.read_all().unwrap();
    assert_eq!(enriched.len(), 2);
    let flat = enriched
        .iter()
        .find(|e| e.mutation.id_mutation == "2023-1")
        .unwrap();
    assert_eq!(flat.classe_energie.as_deref(), Some("C"));
    assert_eq!(flat.annee_construction, Some(1972));
    let house = enriched
        .iter()
        .find(|e| e.mutation.id_mutation == "2023-3")
        .unwrap();
    assert!(!house.is_matched());

    let status = materializer.status().await.unwrap();
    assert!(status.iter().all(|s| s.materialized));
}

#[tokio::test]
async fn test_step_metadata_is_recorded() {
    let (_dir, _fake, materializer) = setup();

    let runs = materializer
        .materialize(Step::DvfInStore, UpstreamPolicy::ReuseMaterialized)
        .await
        .unwrap();

    let steps: Vec<Step> = runs.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![Step::RawDvf, Step::CleanedDvf, Step::DvfInStore]);
    assert_eq!(runs[0].metadata.int("num_files"), Some(1));
    assert_eq!(
        runs[0].metadata.get("departments"),
        Some(&MetadataValue::List(vec!["75".to_string()]))
    );
    assert_eq!(runs[1].metadata.int("rows"), Some(2));
    assert!(matches!(runs[1].metadata.get("size_mb"), Some(MetadataValue::Float(_))));
    assert_eq!(runs[2].metadata.int("row_count"), Some(2));

    let store = open_store(&materializer);
    let last = store.last_materialization("dvf_in_store").unwrap().unwrap();
    assert_eq!(last.run_id, runs[2].run_id.to_string());
    assert_eq!(last.metadata["row_count"], 2);
}

#[tokio::test]
async fn test_materialize_reuses_existing_upstream() {
    let (_dir, fake, materializer) = setup();
    materializer
        .materialize(Step::DvfInStore, UpstreamPolicy::ReuseMaterialized)
        .await
        .unwrap();
    assert_eq!(fake.download_count(), 2);

    let runs = materializer
        .materialize(Step::DvfInStore, UpstreamPolicy::ReuseMaterialized)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].step, Step::DvfInStore);
    assert_eq!(fake.download_count(), 2);

    let runs = materializer
        .materialize(Step::DvfInStore, UpstreamPolicy::Recompute)
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(fake.download_count(), 4);
}

#[tokio::test]
async fn test_empty_clean_keeps_loaded_mutations() {
    let (dir, _fake, materializer) = setup();
    materializer
        .materialize(Step::DvfInStore, UpstreamPolicy::ReuseMaterialized)
        .await
        .unwrap();

    // staging emptied: the next clean yields an empty artifact
    let staged = dir.path().join("raw").join("dvf").join("dvf_2023_75.csv.gz");
    std::fs::remove_file(staged).unwrap();
    let cleaned = materializer.run_step(Step::CleanedDvf).await.unwrap();
    assert!(cleaned.metadata.is_empty());

    let loaded = materializer.run_step(Step::DvfInStore).await.unwrap();
    assert_eq!(loaded.metadata.int("row_count"), Some(2));
    assert_eq!(
        loaded.metadata.get("kept_existing"),
        Some(&MetadataValue::Bool(true))
    );
    assert_eq!(open_store(&materializer).count("mutations").unwrap(), 2);
}

#[tokio::test]
async fn test_failed_dpe_scope_keeps_stored_rows() {
    let (_dir, _fake, materializer) = setup();
    {
        let mut store = open_store(&materializer);
        let marseille = DpeRecord {
            id_dpe: Some("2313E0001".into()),
            code_commune: Some("13055".into()),
            id_parcelle: None,
            classe_energie: Some("D".into()),
            classe_ges: None,
            annee_construction: None,
            surface_habitable: Some(64.0),
            date_etablissement: None,
        };
        store
            .replace_dpe_scope(&DpeScope::Department("13".into()), &[marseille])
            .unwrap();
    }

    let run = materializer.run_step(Step::Dpe).await.unwrap();

    assert_eq!(run.metadata.int("failed_scopes"), Some(1));
    assert_eq!(run.metadata.int("row_count"), Some(2));
    let rows: Vec<DpeRecord> = open_store(&materializer).read_all().unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().any(|r| r.code_commune.as_deref() == Some("13055")));
}

#[tokio::test]
async fn test_missing_staging_directory_fails_clean_step() {
    let (_dir, _fake, materializer) = setup();

    let err = materializer.run_step(Step::CleanedDvf).await.unwrap_err();

    assert!(err.to_string().contains("staging directory"), "{err}");
    let store = open_store(&materializer);
    assert!(store.last_materialization("cleaned_dvf").unwrap().is_none());
}

#[test]
fn test_unknown_step_name_is_rejected() {
    assert!("dvf_in_duckdb".parse::<Step>().is_err());
}
