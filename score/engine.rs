// ========================================================================================
//
//                         THE BIOLOGICAL AGE COMPUTATION ENGINE
//
// ========================================================================================
//
// The engine ties the aging models to the outside world through three narrow
// collaborator traits. It pulls a subject's latest panel from a `MeasurementSupplier`,
// runs the requested model(s), and hands each result to a `ResultSink` exactly once.
// The HD model is shared behind an `Arc` so a long-running process can refit it while
// calculations are in flight.

use crate::hd::{FitFailure, HdError, HdFit, HdModel, ReferenceCohort, Unavailability};
use crate::phenotypic::{PhenotypicAge, PhenotypicError};
use crate::types::{BioAgeResult, ModelKind, PanelError, SubjectId, SubjectSnapshot};
use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Supplies the reference population the HD model is fit to.
pub trait CohortSupplier {
    type Error: Error + Send + Sync + 'static;

    fn reference_cohort(&self) -> Result<ReferenceCohort, Self::Error>;
}

/// Supplies a subject's most recent complete panel and demographics.
pub trait MeasurementSupplier {
    type Error: Error + Send + Sync + 'static;

    fn latest_snapshot(&self, subject_id: SubjectId) -> Result<SubjectSnapshot, Self::Error>;
}

/// Persists computed results.
pub trait ResultSink {
    type Error: Error + Send + Sync + 'static;

    fn submit(&self, subject_id: SubjectId, result: &BioAgeResult) -> Result<(), Self::Error>;
}

/// Which model(s) a calculation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelSelection {
    Single(ModelKind),
    #[default]
    All,
}

impl ModelSelection {
    pub fn models(self) -> Vec<ModelKind> {
        match self {
            ModelSelection::Single(kind) => vec![kind],
            ModelSelection::All => ModelKind::ALL.to_vec(),
        }
    }
}

impl FromStr for ModelSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(ModelSelection::All)
        } else {
            s.parse::<ModelKind>().map(ModelSelection::Single)
        }
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSelection::Single(kind) => write!(f, "{kind}"),
            ModelSelection::All => f.write_str("all"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error("Phenotypic Age could not be computed: {0}")]
    Phenotypic(#[from] PhenotypicError),
    #[error(transparent)]
    Hd(#[from] HdError),
    #[error("Homeostatic Dysregulation fit failed: {0}")]
    Fit(#[from] FitFailure),
    #[error("Data supplier failed: {0}")]
    Supplier(#[source] Box<dyn Error + Send + Sync>),
    #[error("Result sink failed: {0}")]
    Sink(#[source] Box<dyn Error + Send + Sync>),
}

/// The outcome of one calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationReport {
    pub subject_id: SubjectId,
    pub chronological_age: f64,
    /// Results in the order the models ran. Each has been submitted to the sink.
    pub results: Vec<BioAgeResult>,
    /// Models that were requested but could not run, with the reason.
    pub unavailable: Vec<(ModelKind, Unavailability)>,
}

pub struct BioAgeEngine<M, S> {
    measurements: M,
    sink: S,
    phenotypic: PhenotypicAge,
    hd: Arc<HdModel>,
}

impl<M, S> BioAgeEngine<M, S>
where
    M: MeasurementSupplier,
    S: ResultSink,
{
    pub fn new(measurements: M, sink: S, hd: Arc<HdModel>) -> Self {
        Self {
            measurements,
            sink,
            phenotypic: PhenotypicAge,
            hd,
        }
    }

    pub fn hd_model(&self) -> &Arc<HdModel> {
        &self.hd
    }

    pub fn measurements(&self) -> &M {
        &self.measurements
    }

    /// Fits the shared HD model to the supplier's cohort.
    pub fn fit_hd<C: CohortSupplier>(&self, supplier: &C) -> Result<Arc<HdFit>, EngineError> {
        let cohort = supplier
            .reference_cohort()
            .map_err(|e| EngineError::Supplier(Box::new(e)))?;
        Ok(self.hd.fit(&cohort)?)
    }

    /// Runs `selection` for one subject, stamping results with the current time.
    pub fn calculate(
        &self,
        subject_id: SubjectId,
        selection: ModelSelection,
    ) -> Result<CalculationReport, EngineError> {
        self.calculate_at(subject_id, selection, Utc::now())
    }

    pub fn calculate_at(
        &self,
        subject_id: SubjectId,
        selection: ModelSelection,
        computed_at: DateTime<Utc>,
    ) -> Result<CalculationReport, EngineError> {
        let snapshot = self
            .measurements
            .latest_snapshot(subject_id)
            .map_err(|e| EngineError::Supplier(Box::new(e)))?;
        let age = snapshot.chronological_age;

        let mut results = Vec::new();
        let mut unavailable = Vec::new();
        for kind in selection.models() {
            match kind {
                ModelKind::PhenotypicAge => {
                    let years = self.phenotypic.score(&snapshot.panel, age)?;
                    results.push(BioAgeResult::new(kind, years, age, computed_at));
                }
                ModelKind::HomeostaticDysregulation => {
                    match self.hd.bio_age_years(&snapshot.panel.in_model_units()) {
                        Ok(years) => results.push(BioAgeResult::new(kind, years, age, computed_at)),
                        Err(HdError::ModelUnavailable { reason })
                            if selection == ModelSelection::All =>
                        {
                            log::warn!("Skipping {kind} for subject {subject_id}: {reason}");
                            unavailable.push((kind, reason));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        for result in &results {
            self.sink
                .submit(subject_id, result)
                .map_err(|e| EngineError::Sink(Box::new(e)))?;
            log::debug!(
                "Stored {} = {:.2} years for subject {subject_id}",
                result.model_name,
                result.bio_age_years
            );
        }

        Ok(CalculationReport {
            subject_id,
            chronological_age: age,
            results,
            unavailable,
        })
    }
}
