use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// One deduplicated real-estate sale, keyed by (`id_mutation`, `type_local`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id_mutation: String,
    pub date_mutation: Option<NaiveDate>,
    pub nature_mutation: Option<String>,
    pub valeur_fonciere: f64,
    pub code_departement: Option<String>,
    pub code_commune: Option<String>,
    pub nom_commune: Option<String>,
    pub code_postal: Option<String>,
    pub id_parcelle: Option<String>,
    pub type_local: String,
    pub surface_reelle_bati: Option<f64>,
    pub nombre_pieces: Option<i32>,
    pub surface_terrain: Option<f64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub prix_m2: Option<f64>,
    pub annee: Option<i32>,
    pub trimestre: Option<i32>,
}

impl Mutation {
    pub fn natural_key(&self) -> (&str, &str) {
        (&self.id_mutation, &self.type_local)
    }
}

/// Price per built square metre; absent unless the surface is strictly positive.
pub fn price_per_area(valeur_fonciere: f64, surface: Option<f64>) -> Option<f64> {
    match surface {
        Some(s) if s > 0.0 => Some(valeur_fonciere / s),
        _ => None,
    }
}

/// Calendar year and quarter (1-4) of a date.
pub fn year_quarter(date: NaiveDate) -> (i32, i32) {
    (date.year(), (date.month0() / 3 + 1) as i32)
}

/// One Notaires-INSEE observation. `date` is always the first day of a quarter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceIndexPoint {
    pub date: NaiveDate,
    pub indice: f64,
    pub type_bien: String,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MortgageRatePoint {
    pub date: NaiveDate,
    pub taux: f64,
    pub source: String,
}

/// One energy-performance diagnostic. There is no parcel-level key; it is
/// matched to sales by commune and approximate living surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpeRecord {
    pub id_dpe: Option<String>,
    pub code_commune: Option<String>,
    pub id_parcelle: Option<String>,
    pub classe_energie: Option<String>,
    pub classe_ges: Option<String>,
    pub annee_construction: Option<i32>,
    pub surface_habitable: Option<f64>,
    pub date_etablissement: Option<NaiveDate>,
}

/// Static commune reference data. Not populated by any pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommuneRef {
    pub code_commune: String,
    pub nom_commune: Option<String>,
    pub code_departement: Option<String>,
    pub code_region: Option<String>,
    pub population: Option<i64>,
    pub revenu_median: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A sale with the energy-rating fields of its best-effort DPE match.
/// The rating fields are `None` when no diagnostic matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedMutation {
    pub mutation: Mutation,
    pub classe_energie: Option<String>,
    pub classe_ges: Option<String>,
    pub annee_construction: Option<i32>,
}

impl EnrichedMutation {
    pub fn is_matched(&self) -> bool {
        self.classe_energie.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_per_area_absent_without_surface() {
        assert_eq!(price_per_area(200_000.0, Some(50.0)), Some(4000.0));
        assert_eq!(price_per_area(200_000.0, Some(0.0)), None);
        assert_eq!(price_per_area(200_000.0, Some(-3.0)), None);
        assert_eq!(price_per_area(200_000.0, None), None);
    }

    #[test]
    fn test_year_quarter() {
        let d = |m| NaiveDate::from_ymd_opt(2023, m, 15).unwrap();
        assert_eq!(year_quarter(d(1)), (2023, 1));
        assert_eq!(year_quarter(d(3)), (2023, 1));
        assert_eq!(year_quarter(d(4)), (2023, 2));
        assert_eq!(year_quarter(d(9)), (2023, 3));
        assert_eq!(year_quarter(d(12)), (2023, 4));
    }
}
