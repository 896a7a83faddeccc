//! # Phenotypic Age
//!
//! Closed-form biological age from the nine-biomarker panel and chronological age
//! (Levine et al. 2018). The transform runs in two fixed stages:
//!
//! 1. A linear mortality score: `Σ coefficient · transform(value) + 0.0804 · age − 19.9067`.
//! 2. A Gompertz mapping of the implied 10-year mortality risk back onto the age axis.
//!
//! All constants are literature values and are deliberately not configurable.

use crate::types::{Biomarker, PANEL_SIZE, Panel, Transform};
use thiserror::Error;

/// Weight of chronological age in the mortality score.
const AGE_COEFFICIENT: f64 = 0.0804;
/// Intercept of the mortality score.
const MORTALITY_INTERCEPT: f64 = -19.9067;
/// Upper clamp on the mortality risk, keeps `ln(1 - R)` finite.
const MAX_MORTALITY_RISK: f64 = 0.999_999;
const GOMPERTZ_OFFSET: f64 = 141.50;
const GOMPERTZ_RATE: f64 = 0.09165;

/// One entry of the fixed coefficient set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhenotypicCoefficient {
    pub biomarker: Biomarker,
    pub coefficient: f64,
}

impl PhenotypicCoefficient {
    pub fn transform(&self) -> Transform {
        self.biomarker.spec().transform
    }
}

/// Levine 2018 coefficients, in canonical panel order.
pub const PHENOTYPIC_COEFFICIENTS: [PhenotypicCoefficient; PANEL_SIZE] = [
    PhenotypicCoefficient {
        biomarker: Biomarker::Albumin,
        coefficient: -0.0336,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::AlkalinePhosphatase,
        coefficient: 0.00188,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::Creatinine,
        coefficient: 0.0095,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::FastingGlucose,
        coefficient: 0.1953,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::Crp,
        coefficient: 0.0954,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::Wbc,
        coefficient: 0.0554,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::LymphocytePct,
        coefficient: -0.0120,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::Mcv,
        coefficient: 0.0268,
    },
    PhenotypicCoefficient {
        biomarker: Biomarker::Rdw,
        coefficient: 0.3306,
    },
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhenotypicError {
    #[error(
        "Biomarker '{biomarker}' must be positive for its log transform, but the converted value is {value}."
    )]
    NonPositiveLogInput { biomarker: Biomarker, value: f64 },
    #[error("Chronological age must be a finite, non-negative number of years (got {0}).")]
    InvalidAge(f64),
    #[error("Phenotypic Age is not finite for mortality score {mortality_score}.")]
    NonFiniteResult { mortality_score: f64 },
}

/// The stateless Phenotypic Age model.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhenotypicAge;

impl PhenotypicAge {
    /// Each biomarker's term of the linear score, in canonical order.
    ///
    /// Glucose is converted to mmol/L before its coefficient is applied; CRP and WBC
    /// enter on the log scale.
    pub fn contributions(&self, panel: &Panel) -> Result<[f64; PANEL_SIZE], PhenotypicError> {
        let mut terms = [0.0; PANEL_SIZE];
        for (term, entry) in terms.iter_mut().zip(PHENOTYPIC_COEFFICIENTS.iter()) {
            let converted = entry.biomarker.to_model_units(panel.get(entry.biomarker));
            let transformed = match entry.transform() {
                Transform::Identity => converted,
                Transform::NaturalLog => {
                    if converted <= 0.0 {
                        return Err(PhenotypicError::NonPositiveLogInput {
                            biomarker: entry.biomarker,
                            value: converted,
                        });
                    }
                    converted.ln()
                }
            };
            *term = transformed * entry.coefficient;
        }
        Ok(terms)
    }

    /// The mortality score: linear biomarker term plus the age term and intercept.
    pub fn mortality_score(
        &self,
        panel: &Panel,
        chronological_age: f64,
    ) -> Result<f64, PhenotypicError> {
        if !chronological_age.is_finite() || chronological_age < 0.0 {
            return Err(PhenotypicError::InvalidAge(chronological_age));
        }
        let linear_term: f64 = self.contributions(panel)?.iter().sum();
        Ok(linear_term + chronological_age * AGE_COEFFICIENT + MORTALITY_INTERCEPT)
    }

    /// Phenotypic Age in years, rounded to two decimals.
    pub fn score(&self, panel: &Panel, chronological_age: f64) -> Result<f64, PhenotypicError> {
        let mortality_score = self.mortality_score(panel, chronological_age)?;

        // R = 1 - exp(-exp(ms)), written with exp_m1 so tiny risks keep their precision.
        let risk = (-(-mortality_score.exp()).exp_m1()).min(MAX_MORTALITY_RISK);
        // -ln(1 - R)
        let cumulative_hazard = -(-risk).ln_1p();
        let years = GOMPERTZ_OFFSET + cumulative_hazard.ln() / GOMPERTZ_RATE;

        if !years.is_finite() {
            return Err(PhenotypicError::NonFiniteResult { mortality_score });
        }
        Ok(round_to_hundredths(years))
    }
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn typical_panel() -> Panel {
        Panel::from_values([4.2, 85.0, 0.9, 88.0, 1.2, 6.5, 30.0, 90.0, 13.0]).unwrap()
    }

    /// Direct transcription of the published formula, without the numerically careful
    /// rewrites, to check `score` against.
    fn reference_phenotypic_age(values: [f64; PANEL_SIZE], age: f64) -> f64 {
        let glucose = values[3] / 18.0;
        let linear = -0.0336 * values[0]
            + 0.00188 * values[1]
            + 0.0095 * values[2]
            + 0.1953 * glucose
            + 0.0954 * values[4].ln()
            + 0.0554 * values[5].ln()
            - 0.0120 * values[6]
            + 0.0268 * values[7]
            + 0.3306 * values[8];
        let ms = linear + age * 0.0804 - 19.9067;
        let r = f64::min(0.999999, 1.0 - (-(ms.exp())).exp());
        141.50 + (-(1.0 - r).ln()).ln() / 0.09165
    }

    #[test]
    fn glucose_is_converted_before_its_coefficient() {
        let mut values = *typical_panel().values();
        values[Biomarker::FastingGlucose.index()] = 90.0;
        let panel = Panel::from_values(values).unwrap();
        let terms = PhenotypicAge.contributions(&panel).unwrap();
        assert_abs_diff_eq!(
            terms[Biomarker::FastingGlucose.index()],
            0.9765,
            epsilon = 0.001
        );
    }

    #[test]
    fn log_transformed_biomarkers_enter_on_the_log_scale() {
        let terms = PhenotypicAge.contributions(&typical_panel()).unwrap();
        assert_abs_diff_eq!(terms[Biomarker::Crp.index()], 0.0954 * 1.2_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(terms[Biomarker::Wbc.index()], 0.0554 * 6.5_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(terms[Biomarker::Rdw.index()], 0.3306 * 13.0, epsilon = 1e-12);
    }

    #[test]
    fn score_matches_the_published_formula() {
        let panel = typical_panel();
        for age in [25.0, 50.0, 70.0] {
            let expected = reference_phenotypic_age(*panel.values(), age);
            let actual = PhenotypicAge.score(&panel, age).unwrap();
            assert_abs_diff_eq!(actual, expected, epsilon = 0.006);
        }
    }

    #[test]
    fn score_is_deterministic_and_rounded() {
        let panel = typical_panel();
        let first = PhenotypicAge.score(&panel, 50.0).unwrap();
        let second = PhenotypicAge.score(&panel, 50.0).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
        assert_abs_diff_eq!(first * 100.0, (first * 100.0).round(), epsilon = 1e-6);
        assert!(first > 30.0 && first < 70.0, "implausible phenotypic age {first}");
    }

    #[test]
    fn older_subjects_score_older() {
        let panel = typical_panel();
        let young = PhenotypicAge.score(&panel, 30.0).unwrap();
        let old = PhenotypicAge.score(&panel, 70.0).unwrap();
        assert!(old > young);
    }

    #[test]
    fn extreme_risk_is_clamped() {
        let panel =
            Panel::from_values([1.0, 1000.0, 10.0, 900.0, 500.0, 100.0, 1.0, 140.0, 30.0]).unwrap();
        let years = PhenotypicAge.score(&panel, 110.0).unwrap();
        let ceiling = 141.50 + (-(1.0 - 0.999_999_f64).ln()).ln() / 0.09165;
        assert_abs_diff_eq!(years, ceiling, epsilon = 0.011);
    }

    #[test]
    fn non_positive_log_input_is_rejected() {
        let mut values = *typical_panel().values();
        values[Biomarker::Crp.index()] = 0.0;
        let panel = Panel::from_values(values).unwrap();
        match PhenotypicAge.score(&panel, 40.0) {
            Err(PhenotypicError::NonPositiveLogInput { biomarker, value }) => {
                assert_eq!(biomarker, Biomarker::Crp);
                assert_eq!(value, 0.0);
            }
            other => panic!("Expected NonPositiveLogInput, got {other:?}"),
        }
    }

    #[test]
    fn invalid_age_is_rejected() {
        assert_eq!(
            PhenotypicAge.score(&typical_panel(), -1.0),
            Err(PhenotypicError::InvalidAge(-1.0))
        );
    }
}
