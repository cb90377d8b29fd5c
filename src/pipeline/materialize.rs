//! Runs steps of the graph and records each run in the store.
//!
//! A step is considered materialized when its output exists: staged files
//! for `raw_dvf`, the canonical artifact for `cleaned_dvf`, and a recorded
//! run for every table step. Materializing a step only runs the upstream
//! steps that are missing, unless the caller asks to recompute them.

use crate::apis::dpe::{self, DpeClient, DpeScope};
use crate::apis::dvf::DvfClient;
use crate::apis::ecb::EcbClient;
use crate::apis::insee::InseeClient;
use crate::error::Result;
use crate::pipeline::graph::{self, Step};
use crate::pipeline::ingestion::staging;
use crate::pipeline::load::{LoadOutcome, Loader};
use crate::pipeline::processing::dvf_clean::DvfCleaner;
use crate::pipeline::processing::enrich;
use crate::pipeline::resources::PipelineContext;
use crate::pipeline::storage::MaterializationRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<usize> for MetadataValue {
    fn from(v: usize) -> Self {
        MetadataValue::Int(v as i64)
    }
}

impl From<u64> for MetadataValue {
    fn from(v: u64) -> Self {
        MetadataValue::Int(v as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

impl From<&Path> for MetadataValue {
    fn from(v: &Path) -> Self {
        MetadataValue::Text(v.display().to_string())
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(v: Vec<String>) -> Self {
        MetadataValue::List(v)
    }
}

/// Small summary a step reports on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StepMetadata(BTreeMap<String, MetadataValue>);

impl StepMetadata {
    pub fn with(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(MetadataValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// True when the step produced no rows or files.
    pub fn is_empty(&self) -> bool {
        matches!(self.get("empty"), Some(MetadataValue::Bool(true)))
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn size_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct StepRun {
    pub run_id: Uuid,
    pub step: Step,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub metadata: StepMetadata,
}

impl StepRun {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: Step,
    pub error: String,
}

/// Outcome of materializing the whole graph.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub runs: Vec<StepRun>,
    pub failures: Vec<StepFailure>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn completed(&self, step: Step) -> bool {
        self.runs.iter().any(|r| r.step == step)
    }

    fn absorb(&mut self, results: Vec<(Step, Result<StepRun>)>) {
        for (step, result) in results {
            match result {
                Ok(run) => self.runs.push(run),
                Err(e) => self.failures.push(StepFailure {
                    step,
                    error: e.to_string(),
                }),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPolicy {
    /// Run an upstream step only when its output is missing
    ReuseMaterialized,
    /// Run every upstream step again
    Recompute,
}

#[derive(Debug, Clone)]
pub struct StepStatus {
    pub step: Step,
    pub materialized: bool,
    pub last_run: Option<MaterializationRecord>,
}

pub struct Materializer {
    ctx: PipelineContext,
}

impl Materializer {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Materialization state of every step, in graph order.
    pub async fn status(&self) -> Result<Vec<StepStatus>> {
        let records = self
            .ctx
            .stores
            .run_blocking(|store| {
                Step::ALL
                    .iter()
                    .map(|step| store.last_materialization(step.name()))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

        Ok(Step::ALL
            .into_iter()
            .zip(records)
            .map(|(step, last_run)| StepStatus {
                step,
                materialized: self.output_exists(step, last_run.is_some()),
                last_run,
            })
            .collect())
    }

    fn output_exists(&self, step: Step, recorded: bool) -> bool {
        let paths = &self.ctx.config.paths;
        match step {
            Step::RawDvf => staging::list_staged_files(&paths.raw_dvf_dir())
                .map(|files| !files.is_empty())
                .unwrap_or(false),
            Step::CleanedDvf => paths.canonical_artifact().is_file(),
            _ => recorded,
        }
    }

    /// Run `target`, preceded by whichever upstream steps `policy` selects.
    #[instrument(skip(self))]
    pub async fn materialize(&self, target: Step, policy: UpstreamPolicy) -> Result<Vec<StepRun>> {
        let done: HashSet<Step> = match policy {
            UpstreamPolicy::ReuseMaterialized => self
                .status()
                .await?
                .into_iter()
                .filter(|s| s.materialized)
                .map(|s| s.step)
                .collect(),
            UpstreamPolicy::Recompute => HashSet::new(),
        };
        let order = graph::plan(target, |step| Ok(!done.contains(&step)))?;
        info!(
            "Materializing {} via [{}]",
            target,
            order.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );

        let mut runs = Vec::with_capacity(order.len());
        for step in order {
            runs.push(self.run_step(step).await?);
        }
        Ok(runs)
    }

    /// Materialize every step. The DVF chain, the two macro steps and the
    /// DPE step run concurrently; enrichment runs last when both of its
    /// inputs succeeded.
    #[instrument(skip(self))]
    pub async fn run_all(&self) -> RunReport {
        let (dvf, prices, rates, dpe) = tokio::join!(
            self.run_chain(&[Step::RawDvf, Step::CleanedDvf, Step::DvfInStore]),
            self.run_chain(&[Step::PriceIndices]),
            self.run_chain(&[Step::MortgageRates]),
            self.run_chain(&[Step::Dpe]),
        );

        let mut report = RunReport::default();
        for results in [dvf, prices, rates, dpe] {
            report.absorb(results);
        }

        if report.completed(Step::DvfInStore) && report.completed(Step::Dpe) {
            let result = self.run_step(Step::EnrichedMutations).await;
            report.absorb(vec![(Step::EnrichedMutations, result)]);
        } else {
            warn!("Skipping {}: an upstream step failed", Step::EnrichedMutations);
            report.failures.push(StepFailure {
                step: Step::EnrichedMutations,
                error: "skipped: upstream step failed".to_string(),
            });
        }

        if report.success() {
            info!("All {} steps materialized", report.runs.len());
        } else {
            error!(
                "{} steps materialized, {} failed",
                report.runs.len(),
                report.failures.len()
            );
        }
        report
    }

    /// Run `steps` in order, stopping at the first failure.
    async fn run_chain(&self, steps: &[Step]) -> Vec<(Step, Result<StepRun>)> {
        let mut results = Vec::with_capacity(steps.len());
        for &step in steps {
            let result = self.run_step(step).await;
            let failed = result.is_err();
            results.push((step, result));
            if failed {
                break;
            }
        }
        results
    }

    /// Execute one step and record the run.
    pub async fn run_step(&self, step: Step) -> Result<StepRun> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(step = %step, %run_id, "Running step {}", step);

        let metadata = match step {
            Step::RawDvf => self.raw_dvf().await,
            Step::CleanedDvf => self.cleaned_dvf().await,
            Step::DvfInStore => self.dvf_in_store().await,
            Step::PriceIndices => self.price_indices().await,
            Step::MortgageRates => self.mortgage_rates().await,
            Step::Dpe => self.dpe().await,
            Step::EnrichedMutations => self.enriched_mutations().await,
        }
        .map_err(|e| {
            error!(step = %step, %run_id, "Step {} failed: {}", step, e);
            e
        })?;

        if metadata.is_empty() {
            warn!(step = %step, "Step {} produced no output", step);
        }

        let run = StepRun {
            run_id,
            step,
            started_at,
            completed_at: Utc::now(),
            metadata,
        };
        let record = MaterializationRecord {
            step: step.name().to_string(),
            run_id: run_id.to_string(),
            materialized_at: run.completed_at,
            metadata: run.metadata.to_json()?,
        };
        self.ctx
            .stores
            .run_blocking(move |store| store.record_materialization(&record))
            .await?;

        info!(
            step = %step,
            %run_id,
            "Step {} completed in {}ms",
            step,
            run.duration().num_milliseconds()
        );
        Ok(run)
    }

    async fn raw_dvf(&self) -> Result<StepMetadata> {
        let cfg = &self.ctx.config;
        let client = DvfClient::new(self.ctx.http.clone(), &cfg.dvf.base_url, &cfg.paths.raw_dvf_dir());
        let report = client
            .download_all(&cfg.dvf.selected_departments(), &cfg.dvf.years, cfg.dvf.concurrency)
            .await;

        let num_files = report.paths().len();
        let departments: Vec<String> = report.departments().into_iter().map(str::to_string).collect();
        info!(
            "Downloaded {} DVF files ({} missing upstream, {} failed)",
            num_files,
            report.missing_count(),
            report.failed_count()
        );
        Ok(StepMetadata::default()
            .with("num_files", num_files)
            .with("departments", departments)
            .with("missing", report.missing_count())
            .with("failed", report.failed_count())
            .with("bytes", report.downloaded_bytes())
            .with("empty", num_files == 0))
    }

    async fn cleaned_dvf(&self) -> Result<StepMetadata> {
        let cfg = &self.ctx.config;
        let cleaner = DvfCleaner::new(&cfg.clean);
        let staging_dir = cfg.paths.raw_dvf_dir();
        let artifact = cfg.paths.canonical_artifact();

        let summary = tokio::task::spawn_blocking(move || cleaner.run(&staging_dir, &artifact)).await??;

        Ok(StepMetadata::default()
            .with("parquet_path", summary.artifact.as_path())
            .with("size_mb", size_mb(summary.artifact_bytes))
            .with("rows", summary.output_rows)
            .with("raw_rows", summary.raw_rows)
            .with("dropped_rows", summary.dropped_rows())
            .with("files_skipped", summary.files_skipped)
            .with("empty", summary.output_rows == 0))
    }

    async fn dvf_in_store(&self) -> Result<StepMetadata> {
        let loader = Loader::new(&self.ctx.config.load);
        let artifact = self.ctx.config.paths.canonical_artifact();
        let outcome = self
            .ctx
            .stores
            .run_blocking(move |store| loader.load_artifact(store, &artifact))
            .await?;
        Ok(load_metadata(outcome))
    }

    async fn price_indices(&self) -> Result<StepMetadata> {
        let client = InseeClient::new(self.ctx.http.clone(), &self.ctx.config.insee);
        let report = client.fetch_price_indices().await;
        let failed = report.failed_series.len();

        if failed > 0 && report.points.is_empty() {
            warn!("Every INSEE series failed; indices_prix left untouched");
            return Ok(StepMetadata::default()
                .with("row_count", 0usize)
                .with("failed_series", report.failed_series)
                .with("empty", true));
        }

        let loader = Loader::new(&self.ctx.config.load);
        let points = report.points;
        let outcome = self
            .ctx
            .stores
            .run_blocking(move |store| loader.load_rows(store, &points))
            .await?;
        Ok(load_metadata(outcome).with("failed_series", report.failed_series))
    }

    async fn mortgage_rates(&self) -> Result<StepMetadata> {
        let client = EcbClient::new(self.ctx.http.clone(), &self.ctx.config.ecb);
        let rates = match client.fetch_mortgage_rates().await {
            Ok(rates) => rates,
            Err(e) => {
                warn!("ECB fetch failed; taux_hypothecaires left untouched: {}", e);
                return Ok(StepMetadata::default()
                    .with("row_count", 0usize)
                    .with("failed", true)
                    .with("empty", true));
            }
        };

        let loader = Loader::new(&self.ctx.config.load);
        let outcome = self
            .ctx
            .stores
            .run_blocking(move |store| loader.load_rows(store, &rates))
            .await?;
        Ok(load_metadata(outcome).with("failed", false))
    }

    async fn dpe(&self) -> Result<StepMetadata> {
        let cfg = &self.ctx.config.dpe;
        let scopes: Vec<DpeScope> = cfg
            .communes
            .iter()
            .cloned()
            .map(DpeScope::Commune)
            .chain(cfg.departments.iter().cloned().map(DpeScope::Department))
            .collect();

        if scopes.is_empty() {
            warn!("No DPE communes or departments configured");
            return Ok(StepMetadata::default()
                .with("row_count", 0usize)
                .with("scopes", 0usize)
                .with("failed_scopes", 0usize)
                .with("empty", true));
        }
        self.fetch_dpe_scopes(&scopes).await
    }

    /// Fetch and store each scope on its own. A scope whose fetch fails
    /// keeps its previously stored rows.
    pub async fn fetch_dpe_scopes(&self, scopes: &[DpeScope]) -> Result<StepMetadata> {
        let client = DpeClient::new(self.ctx.http.clone(), &self.ctx.config.dpe);
        let mut rows = 0usize;
        let mut failed = Vec::new();

        for scope in scopes {
            let records = match client.fetch(scope).await {
                Ok(records) => dpe::dedupe_by_id(records),
                Err(e) => {
                    warn!("DPE fetch for {} failed; keeping stored rows: {}", scope, e);
                    failed.push(scope.to_string());
                    continue;
                }
            };
            let scope = scope.clone();
            let stored = self
                .ctx
                .stores
                .run_blocking(move |store| store.replace_dpe_scope(&scope, &records))
                .await?;
            rows += stored;
        }

        info!("Stored {} DPE rows across {} scopes", rows, scopes.len() - failed.len());
        Ok(StepMetadata::default()
            .with("row_count", rows)
            .with("scopes", scopes.len())
            .with("failed_scopes", failed.len())
            .with("failed", failed)
            .with("empty", rows == 0))
    }

    async fn enriched_mutations(&self) -> Result<StepMetadata> {
        let tolerance = self.ctx.config.enrich.surface_tolerance;
        let summary = self
            .ctx
            .stores
            .run_blocking(move |store| enrich::run_enrichment(store, tolerance))
            .await?;
        Ok(StepMetadata::default()
            .with("row_count", summary.rows)
            .with("matched", summary.matched)
            .with("empty", summary.rows == 0))
    }
}

fn load_metadata(outcome: LoadOutcome) -> StepMetadata {
    StepMetadata::default()
        .with("row_count", outcome.row_count())
        .with("kept_existing", matches!(outcome, LoadOutcome::KeptExisting { .. }))
        .with("empty", outcome.row_count() == 0)
}
