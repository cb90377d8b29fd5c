//! Source URLs and static catalogues for every upstream the pipeline talks to.
use once_cell::sync::Lazy;

pub const DVF_BASE_URL: &str = "https://files.data.gouv.fr/geo-dvf/latest/csv";
pub const ADEME_DPE_URL: &str =
    "https://data.ademe.fr/data-fair/api/v1/datasets/dpe-v2-logements-existants/lines";
pub const INSEE_BDM_URL: &str = "https://api.insee.fr/series/BDM/V1/data/SERIES_BDM";
pub const ECB_MIR_URL: &str = "https://data-api.ecb.europa.eu/service/data/MIR";

// French mortgage rates, new business, house purchase, over 5 years
pub const ECB_SERIES_KEY: &str = "M.FR.B.A2C.A.C.A.2250.EUR.N";
pub const ECB_SOURCE: &str = "ECB";

/// Years published on geo-dvf
pub const DVF_YEARS: [&str; 6] = ["2020", "2021", "2022", "2023", "2024", "2025"];

// Alsace (67, 68), Moselle (57) and Mayotte (976) are not covered by DVF.
// "20" is Corsica's pre-split code; 2A and 2B are listed explicitly.
pub const DVF_EXCLUDED_DEPARTMENTS: [&str; 5] = ["20", "57", "67", "68", "976"];

/// Every department code with a geo-dvf file.
pub static DVF_DEPARTMENTS: Lazy<Vec<String>> = Lazy::new(|| {
    let mut depts: Vec<String> = (1..=95)
        .map(|i| format!("{i:02}"))
        .filter(|d| !DVF_EXCLUDED_DEPARTMENTS.contains(&d.as_str()))
        .collect();
    depts.push("2A".to_string());
    depts.push("2B".to_string());
    depts.extend((971..=974).map(|i| i.to_string()));
    depts
});

/// Notaires-INSEE price index series: (series id, property category, zone)
pub const INSEE_SERIES: [(&str, &str, &str); 4] = [
    ("010567006", "Appartements", "France"),
    ("010567007", "Maisons", "France"),
    ("010567008", "Appartements", "Île-de-France"),
    ("010567009", "Appartements", "Province"),
];

pub const NATURE_VENTE: &str = "Vente";
pub const TYPE_MAISON: &str = "Maison";
pub const TYPE_APPARTEMENT: &str = "Appartement";

pub const DEFAULT_MAX_PRICE: f64 = 10_000_000.0;
pub const DEFAULT_SURFACE_TOLERANCE: f64 = 5.0;
pub const DPE_PAGE_SIZE: usize = 1000;
pub const DPE_DEPARTMENT_MAX_OFFSET: usize = 100_000;
pub const DPE_COMMUNE_LIMIT: usize = 10_000;

pub const CANONICAL_ARTIFACT_NAME: &str = "dvf_clean.parquet";
pub const STAGING_MANIFEST_NAME: &str = "manifest.ndjson";
