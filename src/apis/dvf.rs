use crate::app::ports::{DownloadStatus, HttpClientPort};
use crate::error::FetchError;
use crate::metrics::FetchMetrics;
use crate::pipeline::ingestion::staging::{self, ManifestEntry};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Downloads geo-dvf department files into the staging directory.
#[derive(Clone)]
pub struct DvfClient {
    http: Arc<dyn HttpClientPort>,
    base_url: String,
    staging_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Downloaded {
        dept: String,
        year: String,
        path: PathBuf,
        bytes: u64,
    },
    /// No file published for this (year, department)
    Missing { dept: String, year: String },
    Failed {
        dept: String,
        year: String,
        error: String,
    },
}

impl DownloadOutcome {
    fn sort_key(&self) -> (&str, &str) {
        match self {
            DownloadOutcome::Downloaded { year, dept, .. }
            | DownloadOutcome::Missing { year, dept }
            | DownloadOutcome::Failed { year, dept, .. } => (year.as_str(), dept.as_str()),
        }
    }
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub outcomes: Vec<DownloadOutcome>,
}

impl DownloadReport {
    pub fn paths(&self) -> Vec<&Path> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                DownloadOutcome::Downloaded { path, .. } => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }

    pub fn departments(&self) -> Vec<&str> {
        let mut depts: Vec<&str> = self
            .outcomes
            .iter()
            .filter_map(|o| match o {
                DownloadOutcome::Downloaded { dept, .. } => Some(dept.as_str()),
                _ => None,
            })
            .collect();
        depts.sort();
        depts.dedup();
        depts
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                DownloadOutcome::Downloaded { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Failed { .. }))
            .count()
    }

    pub fn missing_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Missing { .. }))
            .count()
    }
}

struct UnitResult {
    outcome: DownloadOutcome,
    manifest: Option<ManifestEntry>,
}

impl DvfClient {
    pub fn new(http: Arc<dyn HttpClientPort>, base_url: &str, staging_dir: &Path) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            staging_dir: staging_dir.to_path_buf(),
        }
    }

    pub fn url_for(&self, year: &str, dept: &str) -> String {
        format!("{}/{}/departements/{}.csv.gz", self.base_url, year, dept)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Download one (department, year) file. `Ok(None)` when upstream has no
    /// file for that pair.
    #[instrument(skip(self))]
    pub async fn download_department_year(
        &self,
        dept: &str,
        year: &str,
    ) -> Result<Option<PathBuf>, FetchError> {
        let dest = self.staging_dir.join(staging::staged_file_name(year, dept));
        let url = self.url_for(year, dept);
        info!("Downloading DVF {} dept {} from {}", year, dept, url);

        let t0 = Instant::now();
        match self.http.download(&url, &dest).await? {
            DownloadStatus::Complete { bytes } => {
                FetchMetrics::record_unit_success(t0.elapsed().as_secs_f64(), bytes);
                info!("Saved {} ({} bytes)", dest.display(), bytes);
                Ok(Some(dest))
            }
            DownloadStatus::NotFound => {
                FetchMetrics::record_unit_missing();
                info!("No DVF file for dept {} year {}", dept, year);
                Ok(None)
            }
        }
    }

    async fn download_unit(&self, dept: String, year: String) -> UnitResult {
        match self.download_department_year(&dept, &year).await {
            Ok(Some(path)) => {
                let hash_path = path.clone();
                let digest = tokio::task::spawn_blocking(move || staging::sha256_file(&hash_path)).await;
                let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                let manifest = match digest {
                    Ok(Ok(sha256)) => Some(ManifestEntry {
                        file: staging::staged_file_name(&year, &dept),
                        url: self.url_for(&year, &dept),
                        bytes,
                        sha256,
                        fetched_at: Utc::now(),
                    }),
                    Ok(Err(e)) => {
                        warn!("Could not hash {}: {}", path.display(), e);
                        None
                    }
                    Err(e) => {
                        warn!("Hashing task for {} failed: {}", path.display(), e);
                        None
                    }
                };
                UnitResult {
                    outcome: DownloadOutcome::Downloaded {
                        dept,
                        year,
                        path,
                        bytes,
                    },
                    manifest,
                }
            }
            Ok(None) => UnitResult {
                outcome: DownloadOutcome::Missing { dept, year },
                manifest: None,
            },
            Err(e) => {
                FetchMetrics::record_unit_failed();
                warn!("Failed to download dept {} year {}: {}", dept, year, e);
                UnitResult {
                    outcome: DownloadOutcome::Failed {
                        dept,
                        year,
                        error: e.to_string(),
                    },
                    manifest: None,
                }
            }
        }
    }

    /// Download every (department, year) pair with at most `concurrency`
    /// transfers in flight. A failing pair is recorded and never aborts its
    /// siblings.
    #[instrument(skip(self, departments, years), fields(departments = departments.len(), years = years.len()))]
    pub async fn download_all(
        &self,
        departments: &[String],
        years: &[String],
        concurrency: usize,
    ) -> DownloadReport {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for year in years {
            for dept in departments {
                let client = self.clone();
                let semaphore = semaphore.clone();
                let (dept, year) = (dept.clone(), year.clone());
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    client.download_unit(dept, year).await
                });
            }
        }

        let mut report = DownloadReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(unit) => {
                    if let Some(entry) = &unit.manifest {
                        if let Err(e) = staging::append_manifest(&self.staging_dir, entry) {
                            warn!("Could not append staging manifest: {}", e);
                        }
                    }
                    report.outcomes.push(unit.outcome);
                }
                Err(e) => error!("Download task panicked or was cancelled: {}", e),
            }
        }
        report
            .outcomes
            .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        info!(
            "DVF download finished: {} files, {} missing, {} failed",
            report.paths().len(),
            report.missing_count(),
            report.failed_count()
        );
        report
    }
}
