//! Destination table catalogue and row mappings.

use crate::types::{CommuneRef, DpeRecord, EnrichedMutation, MortgageRatePoint, Mutation, PriceIndexPoint};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::Row;

/// Column layout of one destination table.
#[derive(Debug)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [(&'static str, &'static str)],
    pub primary_key: Option<&'static str>,
    /// Columns that get a secondary index
    pub indexes: &'static [&'static str],
}

impl TableSpec {
    pub fn column_names(&self) -> String {
        self.columns.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", ")
    }

    pub fn create_sql(&self, table: &str) -> String {
        let mut defs: Vec<String> = self.columns.iter().map(|(c, ty)| format!("{c} {ty}")).collect();
        if let Some(pk) = self.primary_key {
            defs.push(format!("PRIMARY KEY ({pk})"));
        }
        format!("CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)", defs.join(",\n    "))
    }

    pub fn index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|col| format!("CREATE INDEX IF NOT EXISTS idx_{0}_{1} ON {0} ({1})", self.name, col))
            .collect()
    }

    pub fn insert_sql(&self, table: &str) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {table} ({}) VALUES ({placeholders})", self.column_names())
    }

    pub fn select_sql(&self) -> String {
        format!("SELECT {} FROM {}", self.column_names(), self.name)
    }
}

/// A type stored one-per-row in a destination table.
pub trait TableRow: Sized {
    const SPEC: &'static TableSpec;

    /// Column values in `SPEC.columns` order.
    fn values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

pub const MUTATIONS: TableSpec = TableSpec {
    name: "mutations",
    columns: &[
        ("id_mutation", "TEXT NOT NULL"),
        ("date_mutation", "TEXT"),
        ("nature_mutation", "TEXT"),
        ("valeur_fonciere", "REAL NOT NULL"),
        ("code_departement", "TEXT"),
        ("code_commune", "TEXT"),
        ("nom_commune", "TEXT"),
        ("code_postal", "TEXT"),
        ("id_parcelle", "TEXT"),
        ("type_local", "TEXT NOT NULL"),
        ("surface_reelle_bati", "REAL"),
        ("nombre_pieces", "INTEGER"),
        ("surface_terrain", "REAL"),
        ("longitude", "REAL"),
        ("latitude", "REAL"),
        ("prix_m2", "REAL"),
        ("annee", "INTEGER"),
        ("trimestre", "INTEGER"),
    ],
    primary_key: Some("id_mutation, type_local"),
    indexes: &["code_commune"],
};

pub const MUTATIONS_ENRICHED: TableSpec = TableSpec {
    name: "mutations_enriched",
    columns: &[
        ("id_mutation", "TEXT NOT NULL"),
        ("date_mutation", "TEXT"),
        ("nature_mutation", "TEXT"),
        ("valeur_fonciere", "REAL NOT NULL"),
        ("code_departement", "TEXT"),
        ("code_commune", "TEXT"),
        ("nom_commune", "TEXT"),
        ("code_postal", "TEXT"),
        ("id_parcelle", "TEXT"),
        ("type_local", "TEXT NOT NULL"),
        ("surface_reelle_bati", "REAL"),
        ("nombre_pieces", "INTEGER"),
        ("surface_terrain", "REAL"),
        ("longitude", "REAL"),
        ("latitude", "REAL"),
        ("prix_m2", "REAL"),
        ("annee", "INTEGER"),
        ("trimestre", "INTEGER"),
        ("classe_energie", "TEXT"),
        ("classe_ges", "TEXT"),
        ("annee_construction", "INTEGER"),
    ],
    primary_key: Some("id_mutation, type_local"),
    indexes: &["code_commune"],
};

pub const INDICES_PRIX: TableSpec = TableSpec {
    name: "indices_prix",
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("indice", "REAL NOT NULL"),
        ("type_bien", "TEXT NOT NULL"),
        ("zone", "TEXT NOT NULL"),
    ],
    primary_key: None,
    indexes: &[],
};

pub const TAUX_HYPOTHECAIRES: TableSpec = TableSpec {
    name: "taux_hypothecaires",
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("taux", "REAL NOT NULL"),
        ("source", "TEXT NOT NULL"),
    ],
    primary_key: None,
    indexes: &[],
};

pub const COMMUNES: TableSpec = TableSpec {
    name: "communes",
    columns: &[
        ("code_commune", "TEXT NOT NULL"),
        ("nom_commune", "TEXT"),
        ("code_departement", "TEXT"),
        ("code_region", "TEXT"),
        ("population", "INTEGER"),
        ("revenu_median", "REAL"),
        ("latitude", "REAL"),
        ("longitude", "REAL"),
    ],
    primary_key: Some("code_commune"),
    indexes: &[],
};

pub const DPE: TableSpec = TableSpec {
    name: "dpe",
    columns: &[
        ("id_dpe", "TEXT"),
        ("code_commune", "TEXT"),
        ("id_parcelle", "TEXT"),
        ("classe_energie", "TEXT"),
        ("classe_ges", "TEXT"),
        ("annee_construction", "INTEGER"),
        ("surface_habitable", "REAL"),
        ("date_etablissement", "TEXT"),
    ],
    primary_key: None,
    indexes: &["code_commune"],
};

/// Every data table, in creation order.
pub static TABLES: [&TableSpec; 6] = [
    &MUTATIONS,
    &INDICES_PRIX,
    &TAUX_HYPOTHECAIRES,
    &COMMUNES,
    &DPE,
    &MUTATIONS_ENRICHED,
];

pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().copied().find(|t| t.name == name)
}

const DATE_FORMAT: &str = "%Y-%m-%d";

fn text(v: Option<&str>) -> Value {
    v.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn real(v: Option<f64>) -> Value {
    v.map_or(Value::Null, Value::Real)
}

fn integer(v: Option<i32>) -> Value {
    v.map_or(Value::Null, |i| Value::Integer(i64::from(i)))
}

fn date(v: Option<NaiveDate>) -> Value {
    v.map_or(Value::Null, |d| Value::Text(d.format(DATE_FORMAT).to_string()))
}

fn get_date(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(col)?;
    Ok(raw.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok()))
}

fn required_date(row: &Row<'_>, col: &str) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(col)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn mutation_values(m: &Mutation) -> Vec<Value> {
    vec![
        Value::Text(m.id_mutation.clone()),
        date(m.date_mutation),
        text(m.nature_mutation.as_deref()),
        Value::Real(m.valeur_fonciere),
        text(m.code_departement.as_deref()),
        text(m.code_commune.as_deref()),
        text(m.nom_commune.as_deref()),
        text(m.code_postal.as_deref()),
        text(m.id_parcelle.as_deref()),
        Value::Text(m.type_local.clone()),
        real(m.surface_reelle_bati),
        integer(m.nombre_pieces),
        real(m.surface_terrain),
        real(m.longitude),
        real(m.latitude),
        real(m.prix_m2),
        integer(m.annee),
        integer(m.trimestre),
    ]
}

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<Mutation> {
    Ok(Mutation {
        id_mutation: row.get("id_mutation")?,
        date_mutation: get_date(row, "date_mutation")?,
        nature_mutation: row.get("nature_mutation")?,
        valeur_fonciere: row.get("valeur_fonciere")?,
        code_departement: row.get("code_departement")?,
        code_commune: row.get("code_commune")?,
        nom_commune: row.get("nom_commune")?,
        code_postal: row.get("code_postal")?,
        id_parcelle: row.get("id_parcelle")?,
        type_local: row.get("type_local")?,
        surface_reelle_bati: row.get("surface_reelle_bati")?,
        nombre_pieces: row.get("nombre_pieces")?,
        surface_terrain: row.get("surface_terrain")?,
        longitude: row.get("longitude")?,
        latitude: row.get("latitude")?,
        prix_m2: row.get("prix_m2")?,
        annee: row.get("annee")?,
        trimestre: row.get("trimestre")?,
    })
}

impl TableRow for Mutation {
    const SPEC: &'static TableSpec = &MUTATIONS;

    fn values(&self) -> Vec<Value> {
        mutation_values(self)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        mutation_from_row(row)
    }
}

impl TableRow for EnrichedMutation {
    const SPEC: &'static TableSpec = &MUTATIONS_ENRICHED;

    fn values(&self) -> Vec<Value> {
        let mut values = mutation_values(&self.mutation);
        values.push(text(self.classe_energie.as_deref()));
        values.push(text(self.classe_ges.as_deref()));
        values.push(integer(self.annee_construction));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(EnrichedMutation {
            mutation: mutation_from_row(row)?,
            classe_energie: row.get("classe_energie")?,
            classe_ges: row.get("classe_ges")?,
            annee_construction: row.get("annee_construction")?,
        })
    }
}

impl TableRow for PriceIndexPoint {
    const SPEC: &'static TableSpec = &INDICES_PRIX;

    fn values(&self) -> Vec<Value> {
        vec![
            date(Some(self.date)),
            Value::Real(self.indice),
            Value::Text(self.type_bien.clone()),
            Value::Text(self.zone.clone()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(PriceIndexPoint {
            date: required_date(row, "date")?,
            indice: row.get("indice")?,
            type_bien: row.get("type_bien")?,
            zone: row.get("zone")?,
        })
    }
}

impl TableRow for MortgageRatePoint {
    const SPEC: &'static TableSpec = &TAUX_HYPOTHECAIRES;

    fn values(&self) -> Vec<Value> {
        vec![
            date(Some(self.date)),
            Value::Real(self.taux),
            Value::Text(self.source.clone()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(MortgageRatePoint {
            date: required_date(row, "date")?,
            taux: row.get("taux")?,
            source: row.get("source")?,
        })
    }
}

impl TableRow for CommuneRef {
    const SPEC: &'static TableSpec = &COMMUNES;

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.code_commune.clone()),
            text(self.nom_commune.as_deref()),
            text(self.code_departement.as_deref()),
            text(self.code_region.as_deref()),
            self.population.map_or(Value::Null, Value::Integer),
            real(self.revenu_median),
            real(self.latitude),
            real(self.longitude),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CommuneRef {
            code_commune: row.get("code_commune")?,
            nom_commune: row.get("nom_commune")?,
            code_departement: row.get("code_departement")?,
            code_region: row.get("code_region")?,
            population: row.get("population")?,
            revenu_median: row.get("revenu_median")?,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
        })
    }
}

impl TableRow for DpeRecord {
    const SPEC: &'static TableSpec = &DPE;

    fn values(&self) -> Vec<Value> {
        vec![
            text(self.id_dpe.as_deref()),
            text(self.code_commune.as_deref()),
            text(self.id_parcelle.as_deref()),
            text(self.classe_energie.as_deref()),
            text(self.classe_ges.as_deref()),
            integer(self.annee_construction),
            real(self.surface_habitable),
            date(self.date_etablissement),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DpeRecord {
            id_dpe: row.get("id_dpe")?,
            code_commune: row.get("code_commune")?,
            id_parcelle: row.get("id_parcelle")?,
            classe_energie: row.get("classe_energie")?,
            classe_ges: row.get("classe_ges")?,
            annee_construction: row.get("annee_construction")?,
            surface_habitable: row.get("surface_habitable")?,
            date_etablissement: get_date(row, "date_etablissement")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_match_column_count() {
        let m = Mutation {
            id_mutation: "1".into(),
            type_local: "Maison".into(),
            valeur_fonciere: 1.0,
            ..Default::default()
        };
        assert_eq!(m.values().len(), MUTATIONS.columns.len());

        let e = EnrichedMutation {
            mutation: m,
            classe_energie: None,
            classe_ges: None,
            annee_construction: None,
        };
        assert_eq!(e.values().len(), MUTATIONS_ENRICHED.columns.len());

        let d = DpeRecord {
            id_dpe: None,
            code_commune: None,
            id_parcelle: None,
            classe_energie: None,
            classe_ges: None,
            annee_construction: None,
            surface_habitable: None,
            date_etablissement: None,
        };
        assert_eq!(d.values().len(), DPE.columns.len());
    }

    #[test]
    fn test_sql_generation() {
        assert_eq!(
            TAUX_HYPOTHECAIRES.insert_sql("taux_hypothecaires__incoming"),
            "INSERT INTO taux_hypothecaires__incoming (date, taux, source) VALUES (?1, ?2, ?3)"
        );
        assert!(MUTATIONS
            .create_sql("mutations")
            .contains("PRIMARY KEY (id_mutation, type_local)"));
        assert_eq!(
            DPE.index_sql(),
            vec!["CREATE INDEX IF NOT EXISTS idx_dpe_code_commune ON dpe (code_commune)"]
        );
        assert!(table_spec("communes").is_some());
        assert!(table_spec("sqlite_master").is_none());
    }
}
