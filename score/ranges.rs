//! # Reference Range Classifier
//!
//! Buckets a measured value against two parallel threshold systems: the wide
//! clinical reference interval and the tighter longevity interval derived from healthy
//! young adults. A value inside both is `Optimal`, inside one is `Normal`, inside
//! neither is `OutOfRange`.
//!
//! The counting rule is only meaningful if every longevity band sits inside the
//! clinical band a subject would be compared against, so `ReferenceTable::new`
//! refuses tables that break that nesting.

use crate::types::{Biomarker, Panel, Sex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandType {
    Clinical,
    Longevity,
}

impl fmt::Display for BandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BandType::Clinical => "clinical",
            BandType::Longevity => "longevity",
        })
    }
}

/// Which subjects a band applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandSex {
    All,
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl BandSex {
    fn matches(self, sex: Sex) -> bool {
        matches!(
            (self, sex),
            (BandSex::All, _) | (BandSex::Male, Sex::Male) | (BandSex::Female, Sex::Female)
        )
    }
}

impl fmt::Display for BandSex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BandSex::All => "All",
            BandSex::Male => "M",
            BandSex::Female => "F",
        })
    }
}

/// An inclusive `[min, max]` interval, in the biomarker's stored unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    fn encloses(&self, inner: &ValueRange) -> bool {
        self.min <= inner.min && inner.max <= self.max
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// One row of the reference table.
///
/// `age_min`/`age_max` describe the population the band was derived from. They are
/// carried for display and are not used to filter bands at lookup time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceBand {
    pub biomarker: Biomarker,
    pub band_type: BandType,
    pub sex: BandSex,
    pub age_min: f64,
    pub age_max: f64,
    pub range: ValueRange,
}

impl ReferenceBand {
    const fn standard(
        biomarker: Biomarker,
        band_type: BandType,
        sex: BandSex,
        ages: (f64, f64),
        min: f64,
        max: f64,
    ) -> Self {
        Self {
            biomarker,
            band_type,
            sex,
            age_min: ages.0,
            age_max: ages.1,
            range: ValueRange { min, max },
        }
    }

    pub fn applies_to(&self, sex: Sex) -> bool {
        self.sex.matches(sex)
    }
}

/// Supplies the reference bands for one biomarker.
pub trait ReferenceBandSupplier {
    fn bands(&self, biomarker: Biomarker) -> Vec<ReferenceBand>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeStatus {
    Optimal,
    Normal,
    OutOfRange,
}

impl fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RangeStatus::Optimal => "Optimal",
            RangeStatus::Normal => "Normal",
            RangeStatus::OutOfRange => "Out of Range",
        })
    }
}

/// Which ranges a caller wants reported alongside the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeSelection {
    #[default]
    Both,
    Clinical,
    Longevity,
}

impl FromStr for RangeSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "both" => Ok(RangeSelection::Both),
            "clinical" => Ok(RangeSelection::Clinical),
            "longevity" => Ok(RangeSelection::Longevity),
            other => Err(format!(
                "Invalid range selection '{other}'. Expected 'both', 'clinical' or 'longevity'."
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub biomarker: Biomarker,
    pub value: f64,
    pub status: RangeStatus,
    pub clinical_range: Option<ValueRange>,
    pub longevity_range: Option<ValueRange>,
}

impl Classification {
    /// Drops the ranges the caller did not ask to see. The status is unaffected.
    pub fn restricted_to(mut self, selection: RangeSelection) -> Self {
        match selection {
            RangeSelection::Both => {}
            RangeSelection::Clinical => self.longevity_range = None,
            RangeSelection::Longevity => self.clinical_range = None,
        }
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RangeError {
    #[error("The {band_type} band for '{biomarker}' (sex {sex}) has min {min} above max {max}.")]
    InvertedBand {
        biomarker: Biomarker,
        band_type: BandType,
        sex: BandSex,
        min: f64,
        max: f64,
    },
    #[error("The {band_type} band for '{biomarker}' (sex {sex}) has age bounds {age_min}-{age_max}.")]
    InvertedAgeBounds {
        biomarker: Biomarker,
        band_type: BandType,
        sex: BandSex,
        age_min: f64,
        age_max: f64,
    },
    #[error("More than one {band_type} band for '{biomarker}' with sex {sex}.")]
    DuplicateBand {
        biomarker: Biomarker,
        band_type: BandType,
        sex: BandSex,
    },
    #[error(
        "The longevity band {longevity} for '{biomarker}' (sex {sex}) is not contained in the clinical band {clinical}."
    )]
    LongevityNotNested {
        biomarker: Biomarker,
        sex: Sex,
        longevity: ValueRange,
        clinical: ValueRange,
    },
}

/// Picks the band of one type that applies to `sex`. A sex-specific row takes
/// precedence over an `All` row.
fn select_band(bands: &[ReferenceBand], band_type: BandType, sex: Sex) -> Option<&ReferenceBand> {
    let mut candidates = bands
        .iter()
        .filter(|band| band.band_type == band_type && band.applies_to(sex));
    let first = candidates.next()?;
    if first.sex != BandSex::All {
        return Some(first);
    }
    Some(candidates.find(|band| band.sex != BandSex::All).unwrap_or(first))
}

/// Classifies one value against whatever bands the supplier has for its biomarker.
pub fn classify<S>(supplier: &S, biomarker: Biomarker, value: f64, sex: Sex) -> Classification
where
    S: ReferenceBandSupplier + ?Sized,
{
    let bands = supplier.bands(biomarker);
    let clinical = select_band(&bands, BandType::Clinical, sex).map(|b| b.range);
    let longevity = select_band(&bands, BandType::Longevity, sex).map(|b| b.range);

    let passes = [clinical, longevity]
        .iter()
        .flatten()
        .filter(|range| range.contains(value))
        .count();
    let status = match passes {
        2 => RangeStatus::Optimal,
        1 => RangeStatus::Normal,
        _ => RangeStatus::OutOfRange,
    };

    Classification {
        biomarker,
        value,
        status,
        clinical_range: clinical,
        longevity_range: longevity,
    }
}

/// A validated snapshot of reference bands.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    bands: Vec<ReferenceBand>,
}

const CLINICAL_AGES: (f64, f64) = (18.0, 120.0);
const LONGEVITY_AGES: (f64, f64) = (20.0, 30.0);

/// Clinical ranges from commercial laboratory references; longevity ranges from the
/// healthy 20-30 year old NHANES subset.
const STANDARD_BANDS: [ReferenceBand; 20] = {
    use BandSex::{All, Female, Male};
    use BandType::{Clinical, Longevity};
    use Biomarker::*;
    [
        ReferenceBand::standard(Albumin, Clinical, All, CLINICAL_AGES, 3.5, 5.0),
        ReferenceBand::standard(AlkalinePhosphatase, Clinical, All, CLINICAL_AGES, 44.0, 147.0),
        ReferenceBand::standard(Creatinine, Clinical, Male, CLINICAL_AGES, 0.74, 1.35),
        ReferenceBand::standard(Creatinine, Clinical, Female, CLINICAL_AGES, 0.59, 1.04),
        ReferenceBand::standard(FastingGlucose, Clinical, All, CLINICAL_AGES, 74.0, 106.0),
        ReferenceBand::standard(Crp, Clinical, All, CLINICAL_AGES, 0.0, 3.0),
        ReferenceBand::standard(Wbc, Clinical, All, CLINICAL_AGES, 3.5, 10.5),
        ReferenceBand::standard(LymphocytePct, Clinical, All, CLINICAL_AGES, 20.0, 45.0),
        ReferenceBand::standard(Mcv, Clinical, All, CLINICAL_AGES, 80.0, 100.0),
        ReferenceBand::standard(Rdw, Clinical, All, CLINICAL_AGES, 11.5, 14.5),
        ReferenceBand::standard(Albumin, Longevity, All, LONGEVITY_AGES, 4.0, 4.8),
        ReferenceBand::standard(AlkalinePhosphatase, Longevity, All, LONGEVITY_AGES, 60.0, 120.0),
        ReferenceBand::standard(Creatinine, Longevity, Male, LONGEVITY_AGES, 0.80, 1.20),
        ReferenceBand::standard(Creatinine, Longevity, Female, LONGEVITY_AGES, 0.65, 1.00),
        ReferenceBand::standard(FastingGlucose, Longevity, All, LONGEVITY_AGES, 80.0, 95.0),
        ReferenceBand::standard(Crp, Longevity, All, LONGEVITY_AGES, 0.0, 1.0),
        ReferenceBand::standard(Wbc, Longevity, All, LONGEVITY_AGES, 4.5, 8.5),
        ReferenceBand::standard(LymphocytePct, Longevity, All, LONGEVITY_AGES, 25.0, 40.0),
        ReferenceBand::standard(Mcv, Longevity, All, LONGEVITY_AGES, 85.0, 95.0),
        ReferenceBand::standard(Rdw, Longevity, All, LONGEVITY_AGES, 12.0, 14.0),
    ]
};

impl ReferenceTable {
    /// Validates and wraps a set of bands.
    pub fn new(bands: Vec<ReferenceBand>) -> Result<Self, RangeError> {
        for (i, band) in bands.iter().enumerate() {
            if !(band.range.min <= band.range.max) {
                return Err(RangeError::InvertedBand {
                    biomarker: band.biomarker,
                    band_type: band.band_type,
                    sex: band.sex,
                    min: band.range.min,
                    max: band.range.max,
                });
            }
            if !(band.age_min <= band.age_max) {
                return Err(RangeError::InvertedAgeBounds {
                    biomarker: band.biomarker,
                    band_type: band.band_type,
                    sex: band.sex,
                    age_min: band.age_min,
                    age_max: band.age_max,
                });
            }
            let duplicated = bands[..i].iter().any(|other| {
                other.biomarker == band.biomarker
                    && other.band_type == band.band_type
                    && other.sex == band.sex
            });
            if duplicated {
                return Err(RangeError::DuplicateBand {
                    biomarker: band.biomarker,
                    band_type: band.band_type,
                    sex: band.sex,
                });
            }
        }

        // Check nesting from each subject's point of view, so precedence between
        // `All` and sex-specific rows is honoured.
        for biomarker in Biomarker::ALL {
            let own: Vec<ReferenceBand> = bands
                .iter()
                .filter(|b| b.biomarker == biomarker)
                .copied()
                .collect();
            for sex in [Sex::Male, Sex::Female] {
                let clinical = select_band(&own, BandType::Clinical, sex);
                let longevity = select_band(&own, BandType::Longevity, sex);
                if let (Some(clinical), Some(longevity)) = (clinical, longevity) {
                    if !clinical.range.encloses(&longevity.range) {
                        return Err(RangeError::LongevityNotNested {
                            biomarker,
                            sex,
                            longevity: longevity.range,
                            clinical: clinical.range,
                        });
                    }
                }
            }
        }

        log::debug!("Reference table validated: {} bands", bands.len());
        Ok(Self { bands })
    }

    /// The built-in table covering all nine biomarkers.
    pub fn standard() -> Self {
        Self {
            bands: STANDARD_BANDS.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn classify(&self, biomarker: Biomarker, value: f64, sex: Sex) -> Classification {
        classify(self, biomarker, value, sex)
    }

    /// Classifies every biomarker of a panel, in canonical order.
    pub fn classify_panel(
        &self,
        panel: &Panel,
        sex: Sex,
        selection: RangeSelection,
    ) -> Vec<Classification> {
        panel
            .iter()
            .map(|(biomarker, value)| self.classify(biomarker, value, sex).restricted_to(selection))
            .collect()
    }
}

impl ReferenceBandSupplier for ReferenceTable {
    fn bands(&self, biomarker: Biomarker) -> Vec<ReferenceBand> {
        self.bands
            .iter()
            .filter(|band| band.biomarker == biomarker)
            .copied()
            .collect()
    }
}
