// ========================================================================================
//
//                       CORE DATA TYPES FOR THE BIOAGE ENGINE
//
// ========================================================================================
//
// The canonical dictionary for everything shared across module boundaries: the fixed
// biomarker panel, the `Panel` value type both aging models consume, subject metadata,
// and the result record handed to the persistence collaborator.
//
// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ========================================================================================
//                                  THE BIOMARKER PANEL
// ========================================================================================

/// The nine blood biomarkers used by both aging models, in canonical order.
///
/// The discriminant is the stable biomarker id used by every external table. Both the
/// Phenotypic Age coefficients and the fitted HD parameters are laid out in this order,
/// so `Biomarker::index()` is the only way a value is ever located inside a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Biomarker {
    Albumin = 1,
    AlkalinePhosphatase = 2,
    Creatinine = 3,
    FastingGlucose = 4,
    Crp = 5,
    Wbc = 6,
    LymphocytePct = 7,
    Mcv = 8,
    Rdw = 9,
}

/// Number of biomarkers in the panel.
pub const PANEL_SIZE: usize = 9;

/// How a raw value is transformed before it enters a linear score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Identity,
    NaturalLog,
}

/// Immutable description of one panel member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomarkerSpec {
    pub biomarker: Biomarker,
    /// Column name used by the tabular inputs.
    pub key: &'static str,
    /// Human-readable name, for display only.
    pub name: &'static str,
    /// Unit the value is stored and reported in.
    pub unit: &'static str,
    pub transform: Transform,
    /// Divisor applied to a stored value to reach model units. Only fasting glucose
    /// (mg/dL to mmol/L) is not 1.
    pub unit_divisor: f64,
}

const PANEL_SPECS: [BiomarkerSpec; PANEL_SIZE] = [
    BiomarkerSpec {
        biomarker: Biomarker::Albumin,
        key: "albumin",
        name: "Albumin",
        unit: "g/dL",
        transform: Transform::Identity,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::AlkalinePhosphatase,
        key: "alkaline_phosphatase",
        name: "Alkaline Phosphatase",
        unit: "U/L",
        transform: Transform::Identity,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::Creatinine,
        key: "creatinine",
        name: "Creatinine",
        unit: "mg/dL",
        transform: Transform::Identity,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::FastingGlucose,
        key: "fasting_glucose",
        name: "Fasting Glucose",
        unit: "mg/dL",
        transform: Transform::Identity,
        unit_divisor: 18.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::Crp,
        key: "crp",
        name: "High-Sensitivity CRP",
        unit: "mg/L",
        transform: Transform::NaturalLog,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::Wbc,
        key: "wbc",
        name: "White Blood Cell Count",
        unit: "10^3 cells/uL",
        transform: Transform::NaturalLog,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::LymphocytePct,
        key: "lymphocyte_pct",
        name: "Lymphocyte Percentage",
        unit: "%",
        transform: Transform::Identity,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::Mcv,
        key: "mcv",
        name: "Mean Corpuscular Volume",
        unit: "fL",
        transform: Transform::Identity,
        unit_divisor: 1.0,
    },
    BiomarkerSpec {
        biomarker: Biomarker::Rdw,
        key: "rdw",
        name: "Red Cell Distribution Width",
        unit: "%",
        transform: Transform::Identity,
        unit_divisor: 1.0,
    },
];

impl Biomarker {
    /// Every biomarker in canonical order. Fit and score both traverse this list.
    pub const ALL: [Biomarker; PANEL_SIZE] = [
        Biomarker::Albumin,
        Biomarker::AlkalinePhosphatase,
        Biomarker::Creatinine,
        Biomarker::FastingGlucose,
        Biomarker::Crp,
        Biomarker::Wbc,
        Biomarker::LymphocytePct,
        Biomarker::Mcv,
        Biomarker::Rdw,
    ];

    /// The stable 1-based id.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// The 0-based position inside any panel-ordered vector.
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id).checked_sub(1)?).copied()
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim();
        PANEL_SPECS
            .iter()
            .find(|spec| spec.key.eq_ignore_ascii_case(key))
            .map(|spec| spec.biomarker)
    }

    #[inline]
    pub fn spec(self) -> &'static BiomarkerSpec {
        &PANEL_SPECS[self.index()]
    }

    pub fn key(self) -> &'static str {
        self.spec().key
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn unit(self) -> &'static str {
        self.spec().unit
    }

    /// Converts a stored value to model units (glucose: mg/dL to mmol/L).
    #[inline]
    pub fn to_model_units(self, value: f64) -> f64 {
        value / self.spec().unit_divisor
    }
}

impl fmt::Display for Biomarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Biomarker {
    type Error = PanelError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Biomarker::from_id(id).ok_or(PanelError::UnknownBiomarker(id))
    }
}

// ========================================================================================
//                               MEASUREMENTS AND PANELS
// ========================================================================================

/// One stored measurement. The unit is fixed by the biomarker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub biomarker: Biomarker,
    pub value: f64,
}

impl Measurement {
    pub fn new(biomarker: Biomarker, value: f64) -> Self {
        Self { biomarker, value }
    }

    pub fn unit(&self) -> &'static str {
        self.biomarker.unit()
    }
}

/// One dated row of a subject's measurement history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRecord {
    pub subject_id: SubjectId,
    pub taken_at: NaiveDate,
    pub biomarker: Biomarker,
    pub value: f64,
}

impl MeasurementRecord {
    pub fn measurement(&self) -> Measurement {
        Measurement::new(self.biomarker, self.value)
    }
}

/// Failures while assembling a complete panel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PanelError {
    #[error("Incomplete biomarker panel: missing {}", format_biomarkers(.missing))]
    Incomplete { missing: Vec<Biomarker> },
    #[error("Biomarker '{0}' was supplied more than once for the same snapshot.")]
    Duplicate(Biomarker),
    #[error("Biomarker '{biomarker}' has a non-finite value ({value}).")]
    NonFinite { biomarker: Biomarker, value: f64 },
    #[error("Unknown biomarker id {0}; expected an id between 1 and 9.")]
    UnknownBiomarker(u8),
}

fn format_biomarkers(list: &[Biomarker]) -> String {
    list.iter()
        .map(|b| b.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A complete snapshot of all nine biomarkers, indexed by `Biomarker::index()`.
///
/// A `Panel` can only be built when every biomarker is present exactly once, so
/// holding one is proof that either model may be run on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Panel([f64; PANEL_SIZE]);

impl Panel {
    /// Builds a panel from values already in canonical order.
    pub fn from_values(values: [f64; PANEL_SIZE]) -> Result<Self, PanelError> {
        for (biomarker, &value) in Biomarker::ALL.iter().zip(values.iter()) {
            if !value.is_finite() {
                return Err(PanelError::NonFinite {
                    biomarker: *biomarker,
                    value,
                });
            }
        }
        Ok(Self(values))
    }

    /// Builds a panel from unordered measurements. Partial panels are rejected,
    /// never imputed.
    pub fn from_measurements<I>(measurements: I) -> Result<Self, PanelError>
    where
        I: IntoIterator<Item = Measurement>,
    {
        let mut slots: [Option<f64>; PANEL_SIZE] = [None; PANEL_SIZE];
        for m in measurements {
            let slot = &mut slots[m.biomarker.index()];
            if slot.is_some() {
                return Err(PanelError::Duplicate(m.biomarker));
            }
            *slot = Some(m.value);
        }

        let missing: Vec<Biomarker> = Biomarker::ALL
            .iter()
            .copied()
            .filter(|b| slots[b.index()].is_none())
            .collect();
        if !missing.is_empty() {
            return Err(PanelError::Incomplete { missing });
        }

        let mut values = [0.0; PANEL_SIZE];
        for (dst, src) in values.iter_mut().zip(slots.iter()) {
            *dst = src.unwrap_or(f64::NAN);
        }
        Self::from_values(values)
    }

    #[inline]
    pub fn get(&self, biomarker: Biomarker) -> f64 {
        self.0[biomarker.index()]
    }

    pub fn values(&self) -> &[f64; PANEL_SIZE] {
        &self.0
    }

    /// Iterates `(biomarker, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Biomarker, f64)> + '_ {
        Biomarker::ALL.iter().copied().zip(self.0.iter().copied())
    }

    /// The same panel expressed in model units.
    pub fn in_model_units(&self) -> Panel {
        let mut values = self.0;
        for (biomarker, value) in Biomarker::ALL.iter().zip(values.iter_mut()) {
            *value = biomarker.to_model_units(*value);
        }
        Panel(values)
    }
}

// ========================================================================================
//                                 SUBJECTS AND RESULTS
// ========================================================================================

/// Biological sex as recorded for a subject. Deserializes through `FromStr`, so every
/// table accepts the same spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Sex {
    pub fn code(self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }
}

impl FromStr for Sex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(Sex::Male),
            "2" => Ok(Sex::Female),
            t if t.eq_ignore_ascii_case("m") || t.eq_ignore_ascii_case("male") => Ok(Sex::Male),
            t if t.eq_ignore_ascii_case("f") || t.eq_ignore_ascii_case("female") => {
                Ok(Sex::Female)
            }
            other => Err(format!("Invalid sex '{other}'. Expected M/F or 1/2.")),
        }
    }
}

impl TryFrom<String> for Sex {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub u32);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the measurement supplier hands the engine for one subject: the latest value
/// of every biomarker, plus the demographics the models need.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectSnapshot {
    pub subject_id: SubjectId,
    pub chronological_age: f64,
    pub sex: Sex,
    pub panel: Panel,
}

/// The aging models this engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "Phenotypic Age")]
    PhenotypicAge,
    #[serde(rename = "Homeostatic Dysregulation")]
    HomeostaticDysregulation,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::PhenotypicAge, ModelKind::HomeostaticDysregulation];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::PhenotypicAge => "Phenotypic Age",
            ModelKind::HomeostaticDysregulation => "Homeostatic Dysregulation",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("phenotypic age") || t.eq_ignore_ascii_case("phenotypic") {
            Ok(ModelKind::PhenotypicAge)
        } else if t.eq_ignore_ascii_case("homeostatic dysregulation") || t.eq_ignore_ascii_case("hd")
        {
            Ok(ModelKind::HomeostaticDysregulation)
        } else {
            Err(format!(
                "Invalid model '{t}'. Expected 'Phenotypic Age' or 'Homeostatic Dysregulation'."
            ))
        }
    }
}

/// One biological-age estimate. Created once per calculation and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BioAgeResult {
    pub model_name: ModelKind,
    pub bio_age_years: f64,
    /// `bio_age_years - chronological_age`.
    pub age_gap: f64,
    pub computed_at: DateTime<Utc>,
}

impl BioAgeResult {
    pub fn new(
        model_name: ModelKind,
        bio_age_years: f64,
        chronological_age: f64,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            model_name,
            bio_age_years,
            age_gap: bio_age_years - chronological_age,
            computed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_measurements() -> Vec<Measurement> {
        vec![
            Measurement::new(Biomarker::Albumin, 4.2),
            Measurement::new(Biomarker::AlkalinePhosphatase, 85.0),
            Measurement::new(Biomarker::Creatinine, 0.9),
            Measurement::new(Biomarker::FastingGlucose, 90.0),
            Measurement::new(Biomarker::Crp, 1.2),
            Measurement::new(Biomarker::Wbc, 6.5),
            Measurement::new(Biomarker::LymphocytePct, 30.0),
            Measurement::new(Biomarker::Mcv, 90.0),
            Measurement::new(Biomarker::Rdw, 13.0),
        ]
    }

    #[test]
    fn ids_and_indices_follow_canonical_order() {
        for (position, biomarker) in Biomarker::ALL.iter().enumerate() {
            assert_eq!(biomarker.index(), position);
            assert_eq!(usize::from(biomarker.id()), position + 1);
            assert_eq!(Biomarker::from_id(biomarker.id()), Some(*biomarker));
            assert_eq!(Biomarker::from_key(biomarker.key()), Some(*biomarker));
        }
        assert_eq!(Biomarker::from_id(0), None);
        assert_eq!(Biomarker::from_id(10), None);
        assert!(matches!(
            Biomarker::try_from(12),
            Err(PanelError::UnknownBiomarker(12))
        ));
    }

    #[test]
    fn only_glucose_changes_in_model_units() {
        let panel = Panel::from_measurements(full_measurements()).unwrap();
        let converted = panel.in_model_units();
        for (biomarker, value) in converted.iter() {
            if biomarker == Biomarker::FastingGlucose {
                assert!((value - 5.0).abs() < 1e-12);
            } else {
                assert_eq!(value, panel.get(biomarker));
            }
        }
    }

    #[test]
    fn measurements_are_reordered_into_the_panel() {
        let mut measurements = full_measurements();
        measurements.reverse();
        let panel = Panel::from_measurements(measurements).unwrap();
        assert_eq!(panel.get(Biomarker::Albumin), 4.2);
        assert_eq!(panel.get(Biomarker::Rdw), 13.0);
    }

    #[test]
    fn partial_panels_are_rejected() {
        let mut measurements = full_measurements();
        measurements.retain(|m| m.biomarker != Biomarker::Crp && m.biomarker != Biomarker::Mcv);
        match Panel::from_measurements(measurements) {
            Err(PanelError::Incomplete { missing }) => {
                assert_eq!(missing, vec![Biomarker::Crp, Biomarker::Mcv]);
            }
            other => panic!("Expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn duplicates_and_non_finite_values_are_rejected() {
        let mut measurements = full_measurements();
        measurements.push(Measurement::new(Biomarker::Albumin, 4.0));
        assert_eq!(
            Panel::from_measurements(measurements),
            Err(PanelError::Duplicate(Biomarker::Albumin))
        );

        let mut values = [1.0; PANEL_SIZE];
        values[Biomarker::Wbc.index()] = f64::NAN;
        assert!(matches!(
            Panel::from_values(values),
            Err(PanelError::NonFinite {
                biomarker: Biomarker::Wbc,
                ..
            })
        ));
    }

    #[test]
    fn result_serializes_with_camel_case_names() {
        let computed_at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let result = BioAgeResult::new(ModelKind::PhenotypicAge, 47.5, 50.0, computed_at);
        assert!((result.age_gap + 2.5).abs() < 1e-12);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["modelName"], "Phenotypic Age");
        assert_eq!(json["bioAgeYears"], 47.5);
        assert_eq!(json["ageGap"], -2.5);
        assert!(json["computedAt"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }

    #[test]
    fn model_names_parse_in_long_and_short_form() {
        assert_eq!("Phenotypic Age".parse::<ModelKind>(), Ok(ModelKind::PhenotypicAge));
        assert_eq!("hd".parse::<ModelKind>(), Ok(ModelKind::HomeostaticDysregulation));
        assert!("Klemera-Doubal".parse::<ModelKind>().is_err());
        assert_eq!("f".parse::<Sex>(), Ok(Sex::Female));
        assert!("x".parse::<Sex>().is_err());
    }
}
