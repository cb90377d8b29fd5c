//! The step graph: what each step needs before it may run, and the
//! time-based schedules an external trigger is expected to follow.
//!
//! ```text
//! raw_dvf -> cleaned_dvf -> dvf_in_store --\
//!                                           +-> enriched_mutations
//! dpe -------------------------------------/
//! price_indices
//! mortgage_rates
//! ```

use crate::error::PipelineError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    RawDvf,
    CleanedDvf,
    DvfInStore,
    PriceIndices,
    MortgageRates,
    Dpe,
    EnrichedMutations,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::RawDvf,
        Step::CleanedDvf,
        Step::DvfInStore,
        Step::PriceIndices,
        Step::MortgageRates,
        Step::Dpe,
        Step::EnrichedMutations,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::RawDvf => "raw_dvf",
            Step::CleanedDvf => "cleaned_dvf",
            Step::DvfInStore => "dvf_in_store",
            Step::PriceIndices => "price_indices",
            Step::MortgageRates => "mortgage_rates",
            Step::Dpe => "dpe",
            Step::EnrichedMutations => "enriched_mutations",
        }
    }

    pub fn group(self) -> &'static str {
        match self {
            Step::RawDvf | Step::CleanedDvf | Step::DvfInStore => "dvf",
            Step::PriceIndices | Step::MortgageRates => "macro",
            Step::Dpe | Step::EnrichedMutations => "energy",
        }
    }

    pub fn deps(self) -> &'static [Step] {
        match self {
            Step::RawDvf | Step::PriceIndices | Step::MortgageRates | Step::Dpe => &[],
            Step::CleanedDvf => &[Step::RawDvf],
            Step::DvfInStore => &[Step::CleanedDvf],
            Step::EnrichedMutations => &[Step::DvfInStore, Step::Dpe],
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Step::RawDvf => "Download raw DVF department files into staging",
            Step::CleanedDvf => "Clean staged DVF files into the canonical Parquet artifact",
            Step::DvfInStore => "Load the canonical artifact into the mutations table",
            Step::PriceIndices => "Fetch Notaires-INSEE price indices into indices_prix",
            Step::MortgageRates => "Fetch ECB mortgage rates into taux_hypothecaires",
            Step::Dpe => "Fetch DPE diagnostics for the configured communes and departments",
            Step::EnrichedMutations => "Join mutations with DPE ratings into mutations_enriched",
        }
    }

    /// Steps whose output is a file rather than a table.
    pub fn produces_file(self) -> bool {
        matches!(self, Step::RawDvf | Step::CleanedDvf)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.name() == s)
            .ok_or_else(|| PipelineError::UnknownStep(s.to_string()))
    }
}

/// Execution order for `target`: each step after everything it depends on.
/// `needs_run` decides whether an upstream step (and, through it, its own
/// upstream) is included; `target` is always included.
pub fn plan<F>(target: Step, mut needs_run: F) -> Result<Vec<Step>, PipelineError>
where
    F: FnMut(Step) -> Result<bool, PipelineError>,
{
    fn visit<F>(step: Step, needs_run: &mut F, order: &mut Vec<Step>) -> Result<(), PipelineError>
    where
        F: FnMut(Step) -> Result<bool, PipelineError>,
    {
        for &dep in step.deps() {
            if !order.contains(&dep) && needs_run(dep)? {
                visit(dep, needs_run, order)?;
            }
        }
        if !order.contains(&step) {
            order.push(step);
        }
        Ok(())
    }

    let mut order = Vec::new();
    visit(target, &mut needs_run, &mut order)?;
    Ok(order)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub name: &'static str,
    pub cron: &'static str,
    pub steps: &'static [Step],
}

/// Declared only; an external scheduler fires them.
pub const SCHEDULES: [Schedule; 2] = [
    Schedule {
        name: "dvf_monthly",
        // 03:00 on the 1st of every month
        cron: "0 3 1 * *",
        steps: &[Step::DvfInStore],
    },
    Schedule {
        name: "macro_quarterly",
        // 04:00 on the 1st of January, April, July and October
        cron: "0 4 1 1,4,7,10 *",
        steps: &[Step::PriceIndices, Step::MortgageRates],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(step.name().parse::<Step>().unwrap(), step);
            assert_eq!(serde_json::to_value(step).unwrap(), step.name());
        }
        assert!(matches!(
            "dvf_in_duckdb".parse::<Step>(),
            Err(PipelineError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_dependencies_point_upstream() {
        for step in Step::ALL {
            let pos = Step::ALL.iter().position(|s| *s == step).unwrap();
            for dep in step.deps() {
                let dep_pos = Step::ALL.iter().position(|s| s == dep).unwrap();
                assert!(dep_pos < pos, "{dep} must be declared before {step}");
            }
        }
        assert!(Step::PriceIndices.deps().is_empty());
        assert!(Step::MortgageRates.deps().is_empty());
    }

    #[test]
    fn test_plan_recompute_everything() {
        let order = plan(Step::EnrichedMutations, |_| Ok(true)).unwrap();
        assert_eq!(
            order,
            vec![
                Step::RawDvf,
                Step::CleanedDvf,
                Step::DvfInStore,
                Step::Dpe,
                Step::EnrichedMutations
            ]
        );
    }

    #[test]
    fn test_plan_reuses_materialized_upstream() {
        // cleaned_dvf already exists, so raw_dvf is not needed either
        let order = plan(Step::DvfInStore, |s| Ok(s != Step::CleanedDvf)).unwrap();
        assert_eq!(order, vec![Step::DvfInStore]);

        let order = plan(Step::DvfInStore, |s| Ok(s == Step::CleanedDvf)).unwrap();
        assert_eq!(order, vec![Step::CleanedDvf, Step::DvfInStore]);
    }

    #[test]
    fn test_schedules_target_known_steps() {
        assert_eq!(SCHEDULES[0].steps, &[Step::DvfInStore]);
        assert_eq!(SCHEDULES[1].cron, "0 4 1 1,4,7,10 *");
    }
}
