//! Loads canonical rows into the destination store with full-replace
//! semantics.

use crate::config::LoadConfig;
use crate::error::Result;
use crate::metrics::LoadMetrics;
use crate::pipeline::storage::{artifact, Store, TableRow};
use crate::types::Mutation;
use std::path::Path;
use std::time::Instant;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Replaced { rows: usize },
    /// The incoming set was empty and the populated table was left as is
    KeptExisting { rows: usize },
}

impl LoadOutcome {
    /// Rows in the destination table after the load.
    pub fn row_count(&self) -> usize {
        match self {
            LoadOutcome::Replaced { rows } | LoadOutcome::KeptExisting { rows } => *rows,
        }
    }
}

pub struct Loader {
    allow_empty_replace: bool,
}

impl Loader {
    pub fn new(config: &LoadConfig) -> Self {
        Self {
            allow_empty_replace: config.allow_empty_replace,
        }
    }

    /// Replace the table behind `R` with `rows`. An empty set does not wipe
    /// a populated table unless `allow_empty_replace` is set.
    pub fn load_rows<R: TableRow>(&self, store: &mut Store, rows: &[R]) -> Result<LoadOutcome> {
        let table = R::SPEC.name;
        if rows.is_empty() && !self.allow_empty_replace {
            let existing = store.count(table)?;
            if existing > 0 {
                LoadMetrics::record_empty_skipped();
                warn!(
                    "Empty load for {} skipped; keeping {} existing rows",
                    table, existing
                );
                return Ok(LoadOutcome::KeptExisting { rows: existing });
            }
        }

        let t0 = Instant::now();
        match store.replace_table(rows) {
            Ok(count) => {
                LoadMetrics::record_replace(count, t0.elapsed().as_secs_f64());
                Ok(LoadOutcome::Replaced { rows: count })
            }
            Err(e) => {
                LoadMetrics::record_failure();
                Err(e)
            }
        }
    }

    /// Load the canonical DVF artifact into `mutations`.
    #[instrument(skip(self, store))]
    pub fn load_artifact(&self, store: &mut Store, artifact_path: &Path) -> Result<LoadOutcome> {
        let rows: Vec<Mutation> = artifact::read_mutations(artifact_path)?;
        info!("Loading {} rows from {}", rows.len(), artifact_path.display());
        let outcome = self.load_rows(store, &rows)?;
        info!("Loaded {} rows into mutations table", outcome.row_count());
        Ok(outcome)
    }
}
