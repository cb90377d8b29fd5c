//! Raw staging area for downloaded DVF files.
//!
//! Files are named `dvf_{year}_{dept}.csv.gz`. In-flight downloads carry a
//! `.part` suffix and are never picked up by [`list_staged_files`]. Every
//! completed download appends one line to `manifest.ndjson`.

use crate::constants::STAGING_MANIFEST_NAME;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

pub fn staged_file_name(year: &str, dept: &str) -> String {
    format!("dvf_{year}_{dept}.csv.gz")
}

/// Recover `(year, dept)` from a staged file name.
pub fn parse_staged_name(name: &str) -> Option<(String, String)> {
    let stem = name.strip_prefix("dvf_")?.strip_suffix(".csv.gz")?;
    let (year, dept) = stem.split_once('_')?;
    if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) || dept.is_empty() {
        return None;
    }
    Some((year.to_string(), dept.to_string()))
}

/// Staged files in `dir`, sorted by name. A missing directory is an error:
/// the caller cannot tell "nothing fetched" from "wrong path".
pub fn list_staged_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_staged = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| parse_staged_name(n).is_some())
            .unwrap_or(false);
        if is_staged && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub url: String,
    pub bytes: u64,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
}

pub fn append_manifest(dir: &Path, entry: &ManifestEntry) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(STAGING_MANIFEST_NAME))?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read the manifest, skipping lines that do not parse.
pub fn read_manifest(dir: &Path) -> Result<Vec<ManifestEntry>> {
    let path = dir.join(STAGING_MANIFEST_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(entry) = serde_json::from_str::<ManifestEntry>(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}
