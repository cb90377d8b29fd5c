//! DVF cleaning: union every staged department file, keep genuine sales of
//! houses and flats inside the price bounds, collapse each
//! (`id_mutation`, `type_local`) to one row and write the canonical artifact.

use crate::config::CleanConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::TransformMetrics;
use crate::pipeline::ingestion::staging;
use crate::pipeline::storage::artifact;
use crate::types::{price_per_area, year_quarter, Mutation};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// One raw geo-dvf line. Columns are matched by header name; absent columns
/// read as `None` and unknown ones are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawDvfRow {
    pub id_mutation: String,
    pub date_mutation: Option<NaiveDate>,
    pub nature_mutation: Option<String>,
    pub valeur_fonciere: Option<f64>,
    pub code_departement: Option<String>,
    pub code_commune: Option<String>,
    pub nom_commune: Option<String>,
    pub code_postal: Option<String>,
    pub id_parcelle: Option<String>,
    pub type_local: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub surface_reelle_bati: Option<f64>,
    #[serde(rename = "nombre_pieces_principales", alias = "nombre_pieces", deserialize_with = "lenient_count")]
    pub nombre_pieces: Option<i32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub surface_terrain: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub longitude: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub latitude: Option<f64>,
}

impl RawDvfRow {
    /// `NaN` and `inf` parse as floats; they are treated as missing.
    fn without_non_finite(mut self) -> Self {
        for value in [
            &mut self.valeur_fonciere,
            &mut self.surface_reelle_bati,
            &mut self.surface_terrain,
            &mut self.longitude,
            &mut self.latitude,
        ] {
            *value = value.filter(|v| v.is_finite());
        }
        self
    }
}

/// Room counts are published as `3` or `3.0`.
fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<i32>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        let s = s.trim();
        s.parse::<i32>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i32))
    }))
}

/// Rows read from one staged file.
#[derive(Debug, Default)]
pub struct FileRows {
    pub rows: Vec<RawDvfRow>,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanSummary {
    pub files_read: usize,
    pub files_skipped: usize,
    pub raw_rows: usize,
    pub malformed_rows: usize,
    pub filtered_rows: usize,
    pub duplicate_rows: usize,
    pub output_rows: usize,
    pub artifact: PathBuf,
    pub artifact_bytes: u64,
}

impl CleanSummary {
    pub fn dropped_rows(&self) -> usize {
        self.malformed_rows + self.filtered_rows + self.duplicate_rows
    }
}

/// `candidate` replaces `current` only with a strictly larger surface;
/// a missing surface ranks below any value.
fn outranks(candidate: Option<f64>, current: Option<f64>) -> bool {
    let finite = |s: Option<f64>| s.filter(|v| v.is_finite());
    match (finite(candidate), finite(current)) {
        (Some(c), Some(k)) => c > k,
        (Some(_), None) => true,
        _ => false,
    }
}

pub struct DvfCleaner {
    max_price: f64,
    nature: String,
    property_types: Vec<String>,
}

impl DvfCleaner {
    pub fn new(config: &CleanConfig) -> Self {
        Self {
            max_price: config.max_price,
            nature: config.nature.clone(),
            property_types: config.property_types.clone(),
        }
    }

    /// Parse a CSV stream. Only an I/O failure is an error; rows that do not
    /// deserialize are counted and dropped.
    pub fn read_csv<R: Read>(&self, input: R) -> std::result::Result<FileRows, csv::Error> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(input);
        reader.headers()?;

        let mut out = FileRows::default();
        for record in reader.deserialize::<RawDvfRow>() {
            match record {
                Ok(row) if !row.id_mutation.trim().is_empty() => out.rows.push(row.without_non_finite()),
                Ok(_) => out.malformed += 1,
                Err(e) if e.is_io_error() => return Err(e),
                Err(_) => out.malformed += 1,
            }
        }
        Ok(out)
    }

    pub fn read_file(&self, path: &Path) -> std::result::Result<FileRows, csv::Error> {
        let file = File::open(path)?;
        self.read_csv(GzDecoder::new(file))
    }

    /// Sale of a kept property type with `0 < valeur_fonciere < max_price`.
    pub fn accepts(&self, row: &RawDvfRow) -> bool {
        let nature_ok = row.nature_mutation.as_deref() == Some(self.nature.as_str());
        let type_ok = row
            .type_local
            .as_deref()
            .map(|t| self.property_types.iter().any(|p| p == t))
            .unwrap_or(false);
        let price_ok = row
            .valeur_fonciere
            .map(|v| v > 0.0 && v < self.max_price)
            .unwrap_or(false);
        nature_ok && type_ok && price_ok
    }

    /// Filter, deduplicate and derive. Returns the canonical rows ordered by
    /// natural key, plus how many rows the filter rejected.
    pub fn clean_rows<I>(&self, rows: I) -> (Vec<Mutation>, usize)
    where
        I: IntoIterator<Item = RawDvfRow>,
    {
        let mut filtered = 0usize;
        let mut survivors: BTreeMap<(String, String), RawDvfRow> = BTreeMap::new();

        for row in rows {
            if !self.accepts(&row) {
                filtered += 1;
                continue;
            }
            let key = (row.id_mutation.clone(), row.type_local.clone().unwrap_or_default());
            let replace = survivors
                .get(&key)
                .map_or(true, |kept| outranks(row.surface_reelle_bati, kept.surface_reelle_bati));
            if replace {
                survivors.insert(key, row);
            }
        }

        let mutations = survivors.into_values().filter_map(to_mutation).collect();
        (mutations, filtered)
    }

    /// Clean every staged file under `staging_dir` into `artifact_path`.
    /// A missing staging directory is fatal; an unreadable file is skipped.
    #[instrument(skip(self))]
    pub fn run(&self, staging_dir: &Path, artifact_path: &Path) -> Result<CleanSummary> {
        let files = staging::list_staged_files(staging_dir).map_err(|e| match e {
            PipelineError::Io(io) => PipelineError::Io(std::io::Error::new(
                io.kind(),
                format!("staging directory {}: {}", staging_dir.display(), io),
            )),
            other => other,
        })?;
        info!("Reading {} staged DVF files from {}", files.len(), staging_dir.display());

        let mut summary = CleanSummary::default();
        let mut raw = Vec::new();
        for path in &files {
            match self.read_file(path) {
                Ok(file_rows) => {
                    summary.files_read += 1;
                    summary.malformed_rows += file_rows.malformed;
                    raw.extend(file_rows.rows);
                }
                Err(e) => {
                    summary.files_skipped += 1;
                    TransformMetrics::record_unreadable_file();
                    warn!("Skipping unreadable staged file {}: {}", path.display(), e);
                }
            }
        }
        summary.raw_rows = raw.len() + summary.malformed_rows;
        info!("Loaded {} raw rows", summary.raw_rows);

        let accepted_input = raw.len();
        let (mutations, filtered) = self.clean_rows(raw);
        summary.filtered_rows = filtered;
        summary.duplicate_rows = accepted_input - filtered - mutations.len();
        summary.output_rows = mutations.len();
        if mutations.is_empty() {
            warn!("Cleaned DVF dataset is empty; writing an empty artifact");
        }
        info!("Cleaned dataset: {} rows", summary.output_rows);

        summary.artifact_bytes = artifact::write_mutations(artifact_path, &mutations)?;
        summary.artifact = artifact_path.to_path_buf();
        TransformMetrics::record_clean(summary.raw_rows, summary.dropped_rows(), summary.output_rows);
        Ok(summary)
    }
}

fn to_mutation(row: RawDvfRow) -> Option<Mutation> {
    let valeur_fonciere = row.valeur_fonciere?;
    let (annee, trimestre) = match row.date_mutation.map(year_quarter) {
        Some((y, q)) => (Some(y), Some(q)),
        None => (None, None),
    };
    Some(Mutation {
        prix_m2: price_per_area(valeur_fonciere, row.surface_reelle_bati),
        id_mutation: row.id_mutation,
        date_mutation: row.date_mutation,
        nature_mutation: row.nature_mutation,
        valeur_fonciere,
        code_departement: row.code_departement,
        code_commune: row.code_commune,
        nom_commune: row.nom_commune,
        code_postal: row.code_postal,
        id_parcelle: row.id_parcelle,
        type_local: row.type_local?,
        surface_reelle_bati: row.surface_reelle_bati,
        nombre_pieces: row.nombre_pieces,
        surface_terrain: row.surface_terrain,
        longitude: row.longitude,
        latitude: row.latitude,
        annee,
        trimestre,
    })
}
