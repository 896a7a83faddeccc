//! Scoring against a fitted reference population.
//!
//! Inputs are panels in model units (glucose in mmol/L), the same units the cohort was
//! fit in. An individual's HD score is the Mahalanobis distance of their z-score vector
//! under the inverse covariance of the z-scored cohort.

use super::fit::HdFit;
use crate::types::Panel;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::Serialize;

/// The outcome of scoring one panel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HdScore {
    /// Mahalanobis distance from the reference centre. Always `>= 0`.
    pub hd_score: f64,
    /// The score mapped onto the age axis, when conversion was requested and the fit
    /// carries an age calibration.
    pub hd_years: Option<f64>,
    pub reference_n: usize,
}

/// Row-wise Mahalanobis distance for a matrix of z-score vectors.
pub(crate) fn mahalanobis_rows(z: ArrayView2<f64>, inverse_covariance: ArrayView2<f64>) -> Array1<f64> {
    let projected = z.dot(&inverse_covariance);
    (&projected * &z)
        .sum_axis(Axis(1))
        .mapv(|squared| squared.max(0.0).sqrt())
}

fn mahalanobis(z: ArrayView1<f64>, inverse_covariance: ArrayView2<f64>) -> f64 {
    // Tiny negative values from rounding are clamped before the square root.
    inverse_covariance.dot(&z).dot(&z).max(0.0).sqrt()
}

impl HdFit {
    /// `(x - mean) / std` for each biomarker, in canonical order.
    pub fn z_scores(&self, panel: &Panel) -> Array1<f64> {
        let values = Array1::from_iter(panel.values().iter().copied());
        (values - &self.means) / &self.stds
    }

    /// Scores one model-unit panel.
    pub fn score(&self, panel: &Panel, convert_to_years: bool) -> HdScore {
        let z = self.z_scores(panel);
        let hd_score = mahalanobis(z.view(), self.inverse_covariance.view());
        let hd_years = if convert_to_years {
            self.age_calibration.map(|cal| cal.years(hd_score))
        } else {
            None
        };
        HdScore {
            hd_score,
            hd_years,
            reference_n: self.reference_n,
        }
    }

    /// Scores many panels in parallel. Output order matches input order.
    pub fn score_batch(&self, panels: &[Panel], convert_to_years: bool) -> Vec<HdScore> {
        panels
            .par_iter()
            .map(|panel| self.score(panel, convert_to_years))
            .collect()
    }
}
