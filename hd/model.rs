// ========================================================================================
//
//                          THE HD MODEL AND ITS LIFECYCLE
//
// ========================================================================================
//
// `HdModel` owns the current fit. Scoring takes a cheap `Arc` snapshot of the fit, so
// concurrent scoring calls never observe a half-updated reference population, and a
// refit swaps the whole snapshot at once. A failed refit leaves the model unavailable
// rather than silently keeping stale parameters.

use super::fit::{FitFailure, HdFit, ReferenceCohort, fit_reference_population};
use super::score::HdScore;
use crate::types::{Measurement, Panel, PanelError};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Why the model cannot score right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Unavailability {
    /// No fit has been attempted or installed.
    NotFit,
    /// The most recent fit attempt failed.
    FitFailed(FitFailure),
    /// The fit exists but carries no HD-to-age conversion, so no age in years can be
    /// reported.
    Uncalibrated,
}

impl fmt::Display for Unavailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailability::NotFit => f.write_str("the model has not been fit to a reference population"),
            Unavailability::FitFailed(reason) => write!(f, "the last fit failed: {reason}"),
            Unavailability::Uncalibrated => {
                f.write_str("the reference population carried no ages, so HD scores cannot be converted to years")
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HdError {
    #[error("Homeostatic Dysregulation model unavailable: {reason}")]
    ModelUnavailable { reason: Unavailability },
    #[error(transparent)]
    Panel(#[from] PanelError),
}

/// A read-only summary of the model's lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum HdStatus {
    Unfit,
    Fit {
        reference_n: usize,
        calibrated: bool,
    },
    FitFailed(FitFailure),
}

impl fmt::Display for HdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HdStatus::Unfit => f.write_str("unfit"),
            HdStatus::Fit {
                reference_n,
                calibrated,
            } => write!(
                f,
                "fit on {reference_n} individuals ({})",
                if *calibrated { "age-calibrated" } else { "no age calibration" }
            ),
            HdStatus::FitFailed(reason) => write!(f, "fit failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
enum FitState {
    Unfit,
    Fit(Arc<HdFit>),
    Failed(FitFailure),
}

#[derive(Debug)]
pub struct HdModel {
    state: RwLock<FitState>,
}

impl Default for HdModel {
    fn default() -> Self {
        Self::new()
    }
}

impl HdModel {
    /// A model in the Unfit state.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FitState::Unfit),
        }
    }

    /// A model that starts from an existing fit, for example one loaded from disk.
    pub fn from_fit(fit: HdFit) -> Self {
        Self {
            state: RwLock::new(FitState::Fit(Arc::new(fit))),
        }
    }

    /// Fits the model to `cohort` and swaps the result in.
    ///
    /// On failure the model becomes unavailable until the next successful fit.
    pub fn fit(&self, cohort: &ReferenceCohort) -> Result<Arc<HdFit>, FitFailure> {
        match fit_reference_population(cohort) {
            Ok(fit) => Ok(self.install(fit)),
            Err(reason) => {
                log::warn!("HD fit failed, model is now unavailable: {reason}");
                *self.state.write().unwrap_or_else(PoisonError::into_inner) =
                    FitState::Failed(reason.clone());
                Err(reason)
            }
        }
    }

    /// Replaces the current fit.
    pub fn install(&self, fit: HdFit) -> Arc<HdFit> {
        let fit = Arc::new(fit);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = FitState::Fit(Arc::clone(&fit));
        fit
    }

    pub fn status(&self) -> HdStatus {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            FitState::Unfit => HdStatus::Unfit,
            FitState::Fit(fit) => HdStatus::Fit {
                reference_n: fit.reference_n,
                calibrated: fit.age_calibration.is_some(),
            },
            FitState::Failed(reason) => HdStatus::FitFailed(reason.clone()),
        }
    }

    /// The current fit, or why there is none.
    pub fn snapshot(&self) -> Result<Arc<HdFit>, HdError> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            FitState::Fit(fit) => Ok(Arc::clone(fit)),
            FitState::Unfit => Err(HdError::ModelUnavailable {
                reason: Unavailability::NotFit,
            }),
            FitState::Failed(reason) => Err(HdError::ModelUnavailable {
                reason: Unavailability::FitFailed(reason.clone()),
            }),
        }
    }

    /// Scores one panel in model units.
    pub fn score(&self, panel: &Panel, convert_to_years: bool) -> Result<HdScore, HdError> {
        Ok(self.snapshot()?.score(panel, convert_to_years))
    }

    /// Scores a set of stored measurements (storage units, glucose in mg/dL). Every
    /// biomarker must be present.
    pub fn score_measurements(
        &self,
        measurements: &[Measurement],
        convert_to_years: bool,
    ) -> Result<HdScore, HdError> {
        let fit = self.snapshot()?;
        let panel = Panel::from_measurements(measurements.iter().copied())?.in_model_units();
        Ok(fit.score(&panel, convert_to_years))
    }

    /// Scores many panels against one snapshot of the fit.
    pub fn score_batch(
        &self,
        panels: &[Panel],
        convert_to_years: bool,
    ) -> Result<Vec<HdScore>, HdError> {
        Ok(self.snapshot()?.score_batch(panels, convert_to_years))
    }

    /// Scores one panel and requires an age in years.
    pub fn bio_age_years(&self, panel: &Panel) -> Result<f64, HdError> {
        self.score(panel, true)?
            .hd_years
            .ok_or(HdError::ModelUnavailable {
                reason: Unavailability::Uncalibrated,
            })
    }
}
