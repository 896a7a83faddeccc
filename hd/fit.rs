// ========================================================================================
//
//                   HOMEOSTATIC DYSREGULATION: REFERENCE POPULATION FIT
//
// ========================================================================================
//
// Fitting reduces a reference cohort to the three objects scoring needs: the
// per-biomarker mean and standard deviation used to z-score an individual, and the
// inverse covariance of the z-scored cohort that turns a z vector into a Mahalanobis
// distance. Everything is laid out in canonical panel order.
//
// The covariance inversion is the single point of numerical fragility. It goes
// through a symmetric eigendecomposition so a near-singular cohort is reported with
// its condition number instead of producing meaningless distances.

use super::score::mahalanobis_rows;
use crate::types::{Biomarker, PANEL_SIZE, Sex};
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Cohorts smaller than this (after dropping incomplete rows) are not fit.
pub const MIN_REFERENCE_COHORT: usize = 20;
/// Covariance matrices with a larger eigenvalue ratio are treated as singular.
pub const MAX_CONDITION_NUMBER: f64 = 1.0e12;

/// One member of the reference population. Values are in model units and may be
/// missing; incomplete rows are dropped before fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortRow {
    pub values: [Option<f64>; PANEL_SIZE],
    pub age: Option<f64>,
    pub sex: Option<Sex>,
}

impl CohortRow {
    pub fn complete(values: [f64; PANEL_SIZE], age: Option<f64>) -> Self {
        Self {
            values: values.map(Some),
            age,
            sex: None,
        }
    }

    /// All nine values, if none is missing.
    pub fn complete_values(&self) -> Option<[f64; PANEL_SIZE]> {
        let mut out = [0.0; PANEL_SIZE];
        for (dst, src) in out.iter_mut().zip(self.values.iter()) {
            *dst = (*src)?;
        }
        Some(out)
    }
}

/// A snapshot of reference-population data, as handed over by the cohort supplier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceCohort {
    rows: Vec<CohortRow>,
}

impl ReferenceCohort {
    pub fn new(rows: Vec<CohortRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[CohortRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FromIterator<CohortRow> for ReferenceCohort {
    fn from_iter<I: IntoIterator<Item = CohortRow>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Why a fit did not produce a usable model. The model stays (or returns to) Unfit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error(
        "Reference cohort has {usable} complete rows ({dropped} dropped for missing values), but at least {required} are required."
    )]
    InsufficientCohort {
        usable: usize,
        dropped: usize,
        required: usize,
    },
    #[error("Biomarker '{biomarker}' has no usable spread in the reference cohort (std = {std}).")]
    DegenerateBiomarker { biomarker: Biomarker, std: f64 },
    #[error(
        "The reference covariance matrix is singular or too ill-conditioned to invert (condition number {condition_number:.3e})."
    )]
    Singular { condition_number: f64 },
    #[error("Eigendecomposition of the reference covariance failed: {0}")]
    Linalg(String),
}

/// Linear map from an HD score to "HD years", fit on the aged rows of the cohort.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeCalibration {
    pub slope: f64,
    pub intercept: f64,
    /// Number of cohort members the line was fit on.
    pub n: usize,
}

impl AgeCalibration {
    #[inline]
    pub fn years(&self, hd_score: f64) -> f64 {
        self.slope * hd_score + self.intercept
    }
}

/// The fitted reference population. Immutable once built; shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdFit {
    /// Number of complete cohort rows the parameters were estimated from.
    pub reference_n: usize,
    /// Eigenvalue ratio of the z-scored covariance.
    pub condition_number: f64,
    /// The ordering of every vector and matrix below. Always the canonical panel.
    pub biomarkers: Vec<Biomarker>,
    pub means: Array1<f64>,
    pub stds: Array1<f64>,
    pub inverse_covariance: Array2<f64>,
    pub age_calibration: Option<AgeCalibration>,
}

/// Relative tolerance when checking a loaded inverse covariance for symmetry.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum HdFitIoError {
    #[error("Failed to read or write HD fit file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML HD fit file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize HD fit to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("HD fit file is inconsistent with the biomarker panel: {0}")]
    Inconsistent(String),
}

impl HdFit {
    /// Saves the fit in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), HdFitIoError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a fit from TOML and checks it against the canonical panel.
    pub fn load(path: &str) -> Result<Self, HdFitIoError> {
        let toml_string = fs::read_to_string(path)?;
        let fit: HdFit = toml::from_str(&toml_string)?;
        fit.validate()?;
        Ok(fit)
    }

    fn validate(&self) -> Result<(), HdFitIoError> {
        if self.biomarkers.as_slice() != Biomarker::ALL.as_slice() {
            return Err(HdFitIoError::Inconsistent(format!(
                "biomarker ordering {:?} differs from the canonical panel",
                self.biomarkers
            )));
        }
        if self.means.len() != PANEL_SIZE || self.stds.len() != PANEL_SIZE {
            return Err(HdFitIoError::Inconsistent(
                "mean/std vectors must have one entry per biomarker".to_string(),
            ));
        }
        if self.inverse_covariance.dim() != (PANEL_SIZE, PANEL_SIZE) {
            return Err(HdFitIoError::Inconsistent(format!(
                "inverse covariance has shape {:?}, expected {PANEL_SIZE}x{PANEL_SIZE}",
                self.inverse_covariance.dim()
            )));
        }
        if self.stds.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(HdFitIoError::Inconsistent(
                "standard deviations must be finite and positive".to_string(),
            ));
        }
        if self.means.iter().any(|m| !m.is_finite()) {
            return Err(HdFitIoError::Inconsistent("means must be finite".to_string()));
        }
        if self.inverse_covariance.iter().any(|v| !v.is_finite()) {
            return Err(HdFitIoError::Inconsistent(
                "inverse covariance must be finite".to_string(),
            ));
        }
        let scale = self
            .inverse_covariance
            .iter()
            .fold(1.0_f64, |acc, v| acc.max(v.abs()));
        for i in 0..PANEL_SIZE {
            for j in (i + 1)..PANEL_SIZE {
                let (a, b) = (self.inverse_covariance[[i, j]], self.inverse_covariance[[j, i]]);
                if (a - b).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(HdFitIoError::Inconsistent(format!(
                        "inverse covariance is not symmetric at ({i}, {j}): {a} vs {b}"
                    )));
                }
            }
        }
        if let Some(calibration) = &self.age_calibration {
            if !(calibration.slope.is_finite() && calibration.intercept.is_finite()) {
                return Err(HdFitIoError::Inconsistent(
                    "age calibration slope and intercept must be finite".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Fits the HD model to a reference cohort.
pub fn fit_reference_population(cohort: &ReferenceCohort) -> Result<HdFit, FitFailure> {
    // --- 1. Keep complete rows only ---
    let complete: Vec<([f64; PANEL_SIZE], Option<f64>)> = cohort
        .rows()
        .iter()
        .filter_map(|row| row.complete_values().map(|values| (values, row.age)))
        .collect();
    let n = complete.len();
    let dropped = cohort.len() - n;

    if n < MIN_REFERENCE_COHORT {
        return Err(FitFailure::InsufficientCohort {
            usable: n,
            dropped,
            required: MIN_REFERENCE_COHORT,
        });
    }
    log::info!("HD reference population: {n} individuals ({dropped} incomplete rows dropped)");

    let data = Array2::from_shape_fn((n, PANEL_SIZE), |(i, j)| complete[i].0[j]);

    // --- 2. Per-biomarker location and scale ---
    let means = data
        .mean_axis(Axis(0))
        .ok_or(FitFailure::InsufficientCohort {
            usable: 0,
            dropped,
            required: MIN_REFERENCE_COHORT,
        })?;
    let stds = data.std_axis(Axis(0), 1.0);
    for ((biomarker, &std), &mean) in Biomarker::ALL.iter().zip(stds.iter()).zip(means.iter()) {
        if !(std.is_finite() && std > f64::EPSILON * mean.abs().max(1.0)) {
            return Err(FitFailure::DegenerateBiomarker {
                biomarker: *biomarker,
                std,
            });
        }
    }

    // --- 3. Covariance of the z-scored cohort and its inverse ---
    let z = (&data - &means) / &stds;
    let covariance = z.t().dot(&z) / (n - 1) as f64;
    let (inverse_covariance, condition_number) = invert_covariance(&covariance)?;
    log::debug!("HD covariance condition number: {condition_number:.3e}");

    // --- 4. Optional HD score to age calibration ---
    let scores = mahalanobis_rows(z.view(), inverse_covariance.view());
    let aged: Vec<(f64, f64)> = scores
        .iter()
        .zip(complete.iter())
        .filter_map(|(&score, (_, age))| age.map(|a| (score, a)))
        .collect();
    let age_calibration = fit_age_calibration(&aged);
    match &age_calibration {
        Some(cal) => log::info!(
            "HD-to-age conversion fitted on {} individuals: HD_years = {:.4} * HD_score + {:.4}",
            cal.n,
            cal.slope,
            cal.intercept
        ),
        None => log::info!("No HD-to-age conversion fitted; HD scores will not be converted to years"),
    }

    Ok(HdFit {
        reference_n: n,
        condition_number,
        biomarkers: Biomarker::ALL.to_vec(),
        means,
        stds,
        inverse_covariance,
        age_calibration,
    })
}

/// Inverts a symmetric covariance matrix through its eigendecomposition.
///
/// Returns the inverse together with the eigenvalue ratio `λ_max / λ_min`.
fn invert_covariance(covariance: &Array2<f64>) -> Result<(Array2<f64>, f64), FitFailure> {
    let (eigenvalues, eigenvectors) = covariance
        .eigh(UPLO::Lower)
        .map_err(|e| FitFailure::Linalg(e.to_string()))?;

    let max_eigenvalue = eigenvalues.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let min_eigenvalue = eigenvalues.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    if !(min_eigenvalue > 0.0) || !max_eigenvalue.is_finite() {
        return Err(FitFailure::Singular {
            condition_number: f64::INFINITY,
        });
    }
    let condition_number = max_eigenvalue / min_eigenvalue;
    if condition_number > MAX_CONDITION_NUMBER {
        return Err(FitFailure::Singular { condition_number });
    }

    // V · diag(1/λ) · Vᵀ
    let reciprocal = eigenvalues.mapv(|lambda| 1.0 / lambda);
    let scaled = &eigenvectors * &reciprocal;
    let inverse = scaled.dot(&eigenvectors.t());
    // Remove rounding asymmetry so the quadratic form is exactly symmetric.
    let symmetric = (&inverse + &inverse.t()) * 0.5;
    Ok((symmetric, condition_number))
}

/// Ordinary least squares of age on HD score: `age ≈ slope · score + intercept`.
fn fit_age_calibration(pairs: &[(f64, f64)]) -> Option<AgeCalibration> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_score = pairs.iter().map(|(s, _)| s).sum::<f64>() / n;
    let mean_age = pairs.iter().map(|(_, a)| a).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for &(score, age) in pairs {
        let dx = score - mean_score;
        sxx += dx * dx;
        sxy += dx * (age - mean_age);
    }
    if !(sxx > f64::EPSILON) {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_age - slope * mean_score;
    if !slope.is_finite() || !intercept.is_finite() {
        return None;
    }
    Some(AgeCalibration {
        slope,
        intercept,
        n: pairs.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hd::fixtures::synthetic_cohort;
    use approx::assert_abs_diff_eq;
    use ndarray_linalg::Inverse;
    use tempfile::NamedTempFile;

    #[test]
    fn small_cohort_is_an_insufficient_fit() {
        let cohort = synthetic_cohort(19, 1);
        match fit_reference_population(&cohort) {
            Err(FitFailure::InsufficientCohort {
                usable,
                dropped,
                required,
            }) => {
                assert_eq!(usable, 19);
                assert_eq!(dropped, 0);
                assert_eq!(required, MIN_REFERENCE_COHORT);
            }
            other => panic!("Expected InsufficientCohort, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_rows_are_dropped_before_counting() {
        let mut rows = synthetic_cohort(25, 2).rows().to_vec();
        for row in rows.iter_mut().take(6) {
            row.values[Biomarker::Crp.index()] = None;
        }
        let cohort = ReferenceCohort::new(rows);
        match fit_reference_population(&cohort) {
            Err(FitFailure::InsufficientCohort { usable, dropped, .. }) => {
                assert_eq!(usable, 19);
                assert_eq!(dropped, 6);
            }
            other => panic!("Expected InsufficientCohort, got {other:?}"),
        }
    }

    #[test]
    fn fit_matches_sample_statistics() {
        let cohort = synthetic_cohort(200, 3);
        let fit = fit_reference_population(&cohort).unwrap();
        assert_eq!(fit.reference_n, 200);
        assert_eq!(fit.biomarkers, Biomarker::ALL.to_vec());

        let column: Vec<f64> = cohort
            .rows()
            .iter()
            .map(|r| r.values[Biomarker::Mcv.index()].unwrap())
            .collect();
        let mean = column.iter().sum::<f64>() / column.len() as f64;
        let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (column.len() - 1) as f64;
        assert_abs_diff_eq!(fit.means[Biomarker::Mcv.index()], mean, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.stds[Biomarker::Mcv.index()], var.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn inverse_matches_reference_linear_algebra() {
        let cohort = synthetic_cohort(150, 4);
        let fit = fit_reference_population(&cohort).unwrap();

        let data = Array2::from_shape_fn((150, PANEL_SIZE), |(i, j)| {
            cohort.rows()[i].values[j].unwrap()
        });
        let z = (&data - &fit.means) / &fit.stds;
        let covariance = z.t().dot(&z) / 149.0;
        let reference_inverse = covariance.inv().unwrap();

        for (a, b) in fit.inverse_covariance.iter().zip(reference_inverse.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn constant_biomarker_is_degenerate() {
        let rows: Vec<CohortRow> = synthetic_cohort(40, 5)
            .rows()
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.values[Biomarker::Rdw.index()] = Some(13.0);
                row
            })
            .collect();
        match fit_reference_population(&ReferenceCohort::new(rows)) {
            Err(FitFailure::DegenerateBiomarker { biomarker, .. }) => {
                assert_eq!(biomarker, Biomarker::Rdw);
            }
            other => panic!("Expected DegenerateBiomarker, got {other:?}"),
        }
    }

    #[test]
    fn collinear_biomarkers_are_singular() {
        let rows: Vec<CohortRow> = synthetic_cohort(60, 6)
            .rows()
            .iter()
            .map(|row| {
                let mut row = row.clone();
                let albumin = row.values[Biomarker::Albumin.index()].unwrap();
                row.values[Biomarker::Creatinine.index()] = Some(0.2 * albumin);
                row
            })
            .collect();
        match fit_reference_population(&ReferenceCohort::new(rows)) {
            Err(FitFailure::Singular { condition_number }) => {
                assert!(condition_number > MAX_CONDITION_NUMBER);
            }
            other => panic!("Expected Singular, got {other:?}"),
        }
    }

    #[test]
    fn age_calibration_is_least_squares() {
        let pairs = [(1.0, 30.0), (2.0, 40.0), (3.0, 50.0), (4.0, 60.0)];
        let cal = fit_age_calibration(&pairs).unwrap();
        assert_abs_diff_eq!(cal.slope, 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cal.intercept, 20.0, epsilon = 1e-12);
        assert_eq!(cal.n, 4);
        assert_abs_diff_eq!(cal.years(2.5), 45.0, epsilon = 1e-12);

        assert_eq!(fit_age_calibration(&[(1.0, 30.0)]), None);
        assert_eq!(fit_age_calibration(&[(2.0, 30.0), (2.0, 50.0)]), None);
    }

    #[test]
    fn cohort_without_ages_has_no_calibration() {
        let rows: Vec<CohortRow> = synthetic_cohort(50, 7)
            .rows()
            .iter()
            .map(|row| CohortRow {
                age: None,
                ..row.clone()
            })
            .collect();
        let fit = fit_reference_population(&ReferenceCohort::new(rows)).unwrap();
        assert!(fit.age_calibration.is_none());
    }

    #[test]
    fn fit_survives_a_toml_round_trip() {
        let fit = fit_reference_population(&synthetic_cohort(80, 8)).unwrap();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fit.save(path).unwrap();
        let loaded = HdFit::load(path).unwrap();

        assert_eq!(loaded.reference_n, fit.reference_n);
        assert_eq!(loaded.biomarkers, fit.biomarkers);
        for (a, b) in loaded.inverse_covariance.iter().zip(fit.inverse_covariance.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_eq!(
            loaded.age_calibration.map(|c| c.n),
            fit.age_calibration.map(|c| c.n)
        );
    }

    #[test]
    fn reordered_fit_file_is_rejected() {
        let mut fit = fit_reference_population(&synthetic_cohort(80, 9)).unwrap();
        fit.biomarkers.swap(0, 1);
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fit.save(path).unwrap();
        assert!(matches!(
            HdFit::load(path),
            Err(HdFitIoError::Inconsistent(_))
        ));
    }

    #[test]
    fn corrupted_fit_values_are_rejected_on_load() {
        let fit = fit_reference_population(&synthetic_cohort(80, 10)).unwrap();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let mut asymmetric = fit.clone();
        asymmetric.inverse_covariance[[0, 1]] += 1.0;
        let mut non_finite = fit.clone();
        non_finite.inverse_covariance[[2, 2]] = f64::NAN;
        let mut bad_calibration = fit.clone();
        bad_calibration.age_calibration = Some(AgeCalibration {
            slope: f64::INFINITY,
            intercept: 30.0,
            n: 80,
        });

        for corrupted in [asymmetric, non_finite, bad_calibration] {
            corrupted.save(path).unwrap();
            assert!(matches!(
                HdFit::load(path),
                Err(HdFitIoError::Inconsistent(_))
            ));
        }

        fit.save(path).unwrap();
        assert!(HdFit::load(path).is_ok());
    }
}
