//! The canonical DVF artifact: one ZSTD-compressed Parquet file holding the
//! cleaned, deduplicated mutations.
//!
//! Every column is OPTIONAL. Dates are stored as `YYYY-MM-DD` strings.

use crate::error::{PipelineError, Result};
use crate::types::Mutation;
use chrono::NaiveDate;
use parquet::basic::{Compression, ZstdLevel};
use parquet::column::writer::ColumnWriterImpl;
use parquet::data_type::{ByteArray, ByteArrayType, DataType, DoubleType, Int32Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field;
use parquet::schema::parser::parse_message_type;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const MUTATION_SCHEMA: &str = "
message mutation {
    OPTIONAL BYTE_ARRAY id_mutation (UTF8);
    OPTIONAL BYTE_ARRAY date_mutation (UTF8);
    OPTIONAL BYTE_ARRAY nature_mutation (UTF8);
    OPTIONAL DOUBLE valeur_fonciere;
    OPTIONAL BYTE_ARRAY code_departement (UTF8);
    OPTIONAL BYTE_ARRAY code_commune (UTF8);
    OPTIONAL BYTE_ARRAY nom_commune (UTF8);
    OPTIONAL BYTE_ARRAY code_postal (UTF8);
    OPTIONAL BYTE_ARRAY id_parcelle (UTF8);
    OPTIONAL BYTE_ARRAY type_local (UTF8);
    OPTIONAL DOUBLE surface_reelle_bati;
    OPTIONAL INT32 nombre_pieces;
    OPTIONAL DOUBLE surface_terrain;
    OPTIONAL DOUBLE longitude;
    OPTIONAL DOUBLE latitude;
    OPTIONAL DOUBLE prix_m2;
    OPTIONAL INT32 annee;
    OPTIONAL INT32 trimestre;
}
";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One column's values in schema order, `None` for nulls.
enum ColumnValues {
    Text(Vec<Option<ByteArray>>),
    Double(Vec<Option<f64>>),
    Int(Vec<Option<i32>>),
}

fn text<'a>(rows: &'a [Mutation], f: impl Fn(&'a Mutation) -> Option<&'a str>) -> ColumnValues {
    ColumnValues::Text(rows.iter().map(|m| f(m).map(ByteArray::from)).collect())
}

fn double(rows: &[Mutation], f: impl Fn(&Mutation) -> Option<f64>) -> ColumnValues {
    ColumnValues::Double(rows.iter().map(f).collect())
}

fn int(rows: &[Mutation], f: impl Fn(&Mutation) -> Option<i32>) -> ColumnValues {
    ColumnValues::Int(rows.iter().map(f).collect())
}

fn columns(rows: &[Mutation]) -> Vec<ColumnValues> {
    let dates: Vec<Option<String>> = rows
        .iter()
        .map(|m| m.date_mutation.map(|d| d.format(DATE_FORMAT).to_string()))
        .collect();
    vec![
        text(rows, |m| Some(m.id_mutation.as_str())),
        ColumnValues::Text(dates.iter().map(|d| d.as_deref().map(ByteArray::from)).collect()),
        text(rows, |m| m.nature_mutation.as_deref()),
        double(rows, |m| Some(m.valeur_fonciere)),
        text(rows, |m| m.code_departement.as_deref()),
        text(rows, |m| m.code_commune.as_deref()),
        text(rows, |m| m.nom_commune.as_deref()),
        text(rows, |m| m.code_postal.as_deref()),
        text(rows, |m| m.id_parcelle.as_deref()),
        text(rows, |m| Some(m.type_local.as_str())),
        double(rows, |m| m.surface_reelle_bati),
        int(rows, |m| m.nombre_pieces),
        double(rows, |m| m.surface_terrain),
        double(rows, |m| m.longitude),
        double(rows, |m| m.latitude),
        double(rows, |m| m.prix_m2),
        int(rows, |m| m.annee),
        int(rows, |m| m.trimestre),
    ]
}

fn write_optional<T: DataType>(writer: &mut ColumnWriterImpl<'_, T>, values: &[Option<T::T>]) -> Result<()>
where
    T::T: Clone,
{
    let defs: Vec<i16> = values.iter().map(|v| i16::from(v.is_some())).collect();
    let present: Vec<T::T> = values.iter().flatten().cloned().collect();
    writer.write_batch(&present, Some(defs.as_slice()), None)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `rows` to `path`. The file is written beside the target and renamed
/// into place, so readers never see a partial artifact. An empty slice
/// produces a valid file with no row groups.
pub fn write_mutations(path: &Path, rows: &[Mutation]) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let schema = Arc::new(parse_message_type(MUTATION_SCHEMA)?);
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build(),
    );

    let tmp = tmp_path(path);
    let file = File::create(&tmp)?;
    let mut writer = SerializedFileWriter::new(file, schema, props)?;

    if !rows.is_empty() {
        let mut row_group = writer.next_row_group()?;
        let mut values = columns(rows).into_iter();
        while let Some(mut column) = row_group.next_column()? {
            let Some(data) = values.next() else {
                return Err(PipelineError::Parse("artifact schema has more columns than rows provide".into()));
            };
            match data {
                ColumnValues::Text(v) => write_optional(column.typed::<ByteArrayType>(), &v)?,
                ColumnValues::Double(v) => write_optional(column.typed::<DoubleType>(), &v)?,
                ColumnValues::Int(v) => write_optional(column.typed::<Int32Type>(), &v)?,
            }
            column.close()?;
        }
        row_group.close()?;
    }
    writer.close()?;

    fs::rename(&tmp, path)?;
    let size = fs::metadata(path)?.len();
    info!("Wrote {} rows to {} ({} bytes)", rows.len(), path.display(), size);
    Ok(size)
}

fn field_str(field: &Field) -> Option<String> {
    match field {
        Field::Str(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn field_f64(field: &Field) -> Option<f64> {
    match field {
        Field::Double(v) => Some(*v),
        Field::Float(v) => Some(f64::from(*v)),
        Field::Int(v) => Some(f64::from(*v)),
        Field::Long(v) => Some(*v as f64),
        _ => None,
    }
}

fn field_i32(field: &Field) -> Option<i32> {
    match field {
        Field::Int(v) => Some(*v),
        Field::Long(v) => i32::try_from(*v).ok(),
        _ => None,
    }
}

/// Read every mutation back from a canonical artifact.
pub fn read_mutations(path: &Path) -> Result<Vec<Mutation>> {
    let reader = SerializedFileReader::new(File::open(path)?)?;
    let expected = reader.metadata().file_metadata().num_rows();
    let mut rows = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));

    for row in reader.get_row_iter(None)? {
        let row = row?;
        let mut m = Mutation::default();
        let mut valeur = None;
        for (name, field) in row.get_column_iter() {
            match name.as_str() {
                "id_mutation" => m.id_mutation = field_str(field).unwrap_or_default(),
                "date_mutation" => {
                    m.date_mutation = field_str(field).and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok())
                }
                "nature_mutation" => m.nature_mutation = field_str(field),
                "valeur_fonciere" => valeur = field_f64(field),
                "code_departement" => m.code_departement = field_str(field),
                "code_commune" => m.code_commune = field_str(field),
                "nom_commune" => m.nom_commune = field_str(field),
                "code_postal" => m.code_postal = field_str(field),
                "id_parcelle" => m.id_parcelle = field_str(field),
                "type_local" => m.type_local = field_str(field).unwrap_or_default(),
                "surface_reelle_bati" => m.surface_reelle_bati = field_f64(field),
                "nombre_pieces" => m.nombre_pieces = field_i32(field),
                "surface_terrain" => m.surface_terrain = field_f64(field),
                "longitude" => m.longitude = field_f64(field),
                "latitude" => m.latitude = field_f64(field),
                "prix_m2" => m.prix_m2 = field_f64(field),
                "annee" => m.annee = field_i32(field),
                "trimestre" => m.trimestre = field_i32(field),
                other => debug!("Ignoring artifact column {}", other),
            }
        }
        if m.id_mutation.is_empty() || m.type_local.is_empty() {
            return Err(PipelineError::Parse(format!(
                "{}: row {} has no natural key",
                path.display(),
                rows.len()
            )));
        }
        m.valeur_fonciere = valeur.ok_or_else(|| {
            PipelineError::Parse(format!("{}: mutation {} has no value", path.display(), m.id_mutation))
        })?;
        rows.push(m);
    }
    Ok(rows)
}
