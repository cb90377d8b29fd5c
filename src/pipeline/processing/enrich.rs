//! Best-effort energy-rating enrichment of sales.
//!
//! DVF sales and DPE diagnostics share no record identifier, so a sale is
//! matched to a diagnostic in the same commune whose living surface is
//! within the tolerance of the sale's built surface (strictly less than).
//! Only diagnostics that carry an energy class are candidates, and for each
//! (commune, surface) only the most recently established one is kept.
//!
//! When several candidates fall within tolerance the most recent
//! `date_etablissement` wins, then the smallest surface difference, then
//! the smallest `id_dpe`. A sale without a candidate keeps empty rating
//! fields. Completeness is not guaranteed.

use crate::error::Result;
use crate::metrics::TransformMetrics;
use crate::pipeline::storage::Store;
use crate::types::{DpeRecord, EnrichedMutation, Mutation};
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DpeCandidate {
    pub id_dpe: Option<String>,
    pub surface: f64,
    pub date_etablissement: Option<NaiveDate>,
    pub classe_energie: String,
    pub classe_ges: Option<String>,
    pub annee_construction: Option<i32>,
}

impl DpeCandidate {
    fn from_record(record: &DpeRecord) -> Option<(String, Self)> {
        let commune = record.code_commune.clone()?;
        let surface = record.surface_habitable.filter(|s| s.is_finite())?;
        let classe_energie = record.classe_energie.clone()?;
        Some((
            commune,
            Self {
                id_dpe: record.id_dpe.clone(),
                surface,
                date_etablissement: record.date_etablissement,
                classe_energie,
                classe_ges: record.classe_ges.clone(),
                annee_construction: record.annee_construction,
            },
        ))
    }

    /// Newer first, then lower id.
    fn recency(&self, other: &Self) -> Ordering {
        self.date_etablissement
            .cmp(&other.date_etablissement)
            .then_with(|| other.id_dpe.cmp(&self.id_dpe))
    }
}

/// Candidates per commune, sorted by surface.
#[derive(Debug, Default)]
pub struct DpeIndex {
    by_commune: HashMap<String, Vec<DpeCandidate>>,
}

impl DpeIndex {
    pub fn build(records: &[DpeRecord]) -> Self {
        let mut latest: HashMap<(String, u64), DpeCandidate> = HashMap::new();
        for (commune, candidate) in records.iter().filter_map(DpeCandidate::from_record) {
            // +0.0 so that -0.0 and 0.0 share a key
            let key = (commune, (candidate.surface + 0.0).to_bits());
            let newer = latest
                .get(&key)
                .map_or(true, |kept| candidate.recency(kept) == Ordering::Greater);
            if newer {
                latest.insert(key, candidate);
            }
        }

        let mut by_commune: HashMap<String, Vec<DpeCandidate>> = HashMap::new();
        for ((commune, _), candidate) in latest {
            by_commune.entry(commune).or_default().push(candidate);
        }
        for candidates in by_commune.values_mut() {
            candidates.sort_by(|a, b| a.surface.total_cmp(&b.surface));
        }
        Self { by_commune }
    }

    pub fn len(&self) -> usize {
        self.by_commune.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_commune.is_empty()
    }

    pub fn best_match(&self, commune: &str, surface: f64, tolerance: f64) -> Option<&DpeCandidate> {
        if !surface.is_finite() {
            return None;
        }
        let candidates = self.by_commune.get(commune)?;
        let lo = candidates.partition_point(|c| c.surface <= surface - tolerance);
        let hi = candidates.partition_point(|c| c.surface < surface + tolerance);
        let diff = |c: &DpeCandidate| (c.surface - surface).abs();

        candidates
            .get(lo..hi.max(lo))?
            .iter()
            .filter(|c| diff(*c) < tolerance)
            .max_by(|a, b| {
                a.date_etablissement
                    .cmp(&b.date_etablissement)
                    .then_with(|| diff(*b).total_cmp(&diff(*a)))
                    .then_with(|| b.id_dpe.cmp(&a.id_dpe))
            })
    }
}

pub fn enrich_mutation(mutation: Mutation, index: &DpeIndex, tolerance: f64) -> EnrichedMutation {
    let matched = match (mutation.code_commune.as_deref(), mutation.surface_reelle_bati) {
        (Some(commune), Some(surface)) => index.best_match(commune, surface, tolerance),
        _ => None,
    };
    EnrichedMutation {
        classe_energie: matched.map(|c| c.classe_energie.clone()),
        classe_ges: matched.and_then(|c| c.classe_ges.clone()),
        annee_construction: matched.and_then(|c| c.annee_construction),
        mutation,
    }
}

pub fn enrich_mutations(mutations: Vec<Mutation>, dpe: &[DpeRecord], tolerance: f64) -> Vec<EnrichedMutation> {
    let index = DpeIndex::build(dpe);
    mutations
        .into_iter()
        .map(|m| enrich_mutation(m, &index, tolerance))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichSummary {
    pub rows: usize,
    pub matched: usize,
}

/// Rebuild `mutations_enriched` from the current `mutations` and `dpe`
/// tables. Neither source table is modified.
#[instrument(skip(store))]
pub fn run_enrichment(store: &mut Store, tolerance: f64) -> Result<EnrichSummary> {
    let mutations: Vec<Mutation> = store.read_all()?;
    let dpe: Vec<DpeRecord> = store.read_all()?;
    if dpe.is_empty() {
        warn!("No DPE rows loaded; every sale will have empty rating fields");
    }

    let enriched = enrich_mutations(mutations, &dpe, tolerance);
    let matched = enriched.iter().filter(|e| e.is_matched()).count();
    let rows = store.replace_table(&enriched)?;

    TransformMetrics::record_enrichment(rows, matched);
    info!("Enriched mutations: {} rows, {} with DPE data", rows, matched);
    Ok(EnrichSummary { rows, matched })
}
