//! # File-backed collaborators
//!
//! Small delimited tables read and written with `csv` + `serde`:
//!
//! - reference bands: headerless CSV, `#` comments,
//!   `BiomarkerID,RangeType,Sex,AgeMin,AgeMax,MinVal,MaxVal`
//! - measurement history: TSV `subject_id, taken_at, biomarker_id, value`
//! - subjects: TSV `subject_id, birth_date, sex`
//! - results: append-only TSV `subject_id, model_name, bio_age_years, age_gap, computed_at`
//!
//! The reference cohort is larger and column-oriented; it is loaded through polars in
//! `hd::data`.

use crate::engine::{CohortSupplier, MeasurementSupplier, ResultSink};
use crate::hd::{DataError, ReferenceCohort, load_reference_cohort};
use crate::ranges::{BandSex, BandType, RangeError, ReferenceBand, ReferenceTable, ValueRange};
use crate::types::{
    Biomarker, BioAgeResult, MeasurementRecord, ModelKind, Panel, PanelError, Sex, SubjectId,
    SubjectSnapshot,
};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed row in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error("Non-finite value {value} for biomarker '{biomarker}' in '{path}'.")]
    NonFiniteValue {
        path: PathBuf,
        biomarker: Biomarker,
        value: f64,
    },
    #[error("Subject {subject_id} is listed more than once in '{path}'.")]
    DuplicateSubject { path: PathBuf, subject_id: SubjectId },
    #[error("Subject {0} is not listed in the subjects table.")]
    UnknownSubject(SubjectId),
    #[error("Subject {subject_id} has a birth date ({birth_date}) after the evaluation date ({today}).")]
    BirthAfterEvaluation {
        subject_id: SubjectId,
        birth_date: NaiveDate,
        today: NaiveDate,
    },
}

fn open_reader(path: &Path, delimiter: u8, has_headers: bool) -> Result<csv::Reader<File>, TableError> {
    let file = File::open(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(file))
}

fn csv_error(path: &Path) -> impl Fn(csv::Error) -> TableError + '_ {
    move |source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

// ========================================================================================
//                                   REFERENCE BANDS
// ========================================================================================

#[derive(Debug, Deserialize)]
struct BandRow(u8, BandType, BandSex, f64, f64, f64, f64);

/// Loads and validates a reference band table.
pub fn load_reference_bands(path: &Path) -> Result<ReferenceTable, TableError> {
    let mut reader = open_reader(path, b',', false)?;
    let mut bands = Vec::new();
    for row in reader.deserialize::<BandRow>() {
        let BandRow(id, band_type, sex, age_min, age_max, min, max) = row.map_err(csv_error(path))?;
        bands.push(ReferenceBand {
            biomarker: Biomarker::try_from(id)?,
            band_type,
            sex,
            age_min,
            age_max,
            range: ValueRange { min, max },
        });
    }
    log::info!("Loaded {} reference bands from '{}'", bands.len(), path.display());
    Ok(ReferenceTable::new(bands)?)
}

// ========================================================================================
//                                  REFERENCE COHORT
// ========================================================================================

/// Reads the reference population from a TSV file on every call.
#[derive(Debug, Clone)]
pub struct CohortFile {
    path: PathBuf,
}

impl CohortFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CohortSupplier for CohortFile {
    type Error = DataError;

    fn reference_cohort(&self) -> Result<ReferenceCohort, Self::Error> {
        load_reference_cohort(&self.path.to_string_lossy())
    }
}

// ========================================================================================
//                               MEASUREMENTS AND SUBJECTS
// ========================================================================================

#[derive(Debug, Deserialize)]
struct MeasurementRow {
    subject_id: u32,
    taken_at: NaiveDate,
    biomarker_id: u8,
    value: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct SubjectRow {
    subject_id: u32,
    birth_date: NaiveDate,
    sex: Sex,
}

/// Every measurement and subject, held in memory and evaluated as of `today`.
#[derive(Debug, Clone)]
pub struct MeasurementTable {
    records: Vec<MeasurementRecord>,
    subjects: HashMap<SubjectId, SubjectRow>,
    today: NaiveDate,
}

impl MeasurementTable {
    pub fn load(
        measurements_path: &Path,
        subjects_path: &Path,
        today: NaiveDate,
    ) -> Result<Self, TableError> {
        let mut reader = open_reader(measurements_path, b'\t', true)?;
        let mut records = Vec::new();
        for row in reader.deserialize::<MeasurementRow>() {
            let row = row.map_err(csv_error(measurements_path))?;
            let biomarker = Biomarker::try_from(row.biomarker_id)?;
            if !row.value.is_finite() {
                return Err(TableError::NonFiniteValue {
                    path: measurements_path.to_path_buf(),
                    biomarker,
                    value: row.value,
                });
            }
            records.push(MeasurementRecord {
                subject_id: SubjectId(row.subject_id),
                taken_at: row.taken_at,
                biomarker,
                value: row.value,
            });
        }

        let mut reader = open_reader(subjects_path, b'\t', true)?;
        let mut subjects = HashMap::new();
        for row in reader.deserialize::<SubjectRow>() {
            let row = row.map_err(csv_error(subjects_path))?;
            let subject_id = SubjectId(row.subject_id);
            if subjects.insert(subject_id, row).is_some() {
                return Err(TableError::DuplicateSubject {
                    path: subjects_path.to_path_buf(),
                    subject_id,
                });
            }
        }

        log::info!(
            "Loaded {} measurements for {} subjects",
            records.len(),
            subjects.len()
        );
        Ok(Self {
            records,
            subjects,
            today,
        })
    }

    pub fn from_parts(
        records: Vec<MeasurementRecord>,
        subjects: impl IntoIterator<Item = (SubjectId, NaiveDate, Sex)>,
        today: NaiveDate,
    ) -> Self {
        let subjects = subjects
            .into_iter()
            .map(|(id, birth_date, sex)| {
                (
                    id,
                    SubjectRow {
                        subject_id: id.0,
                        birth_date,
                        sex,
                    },
                )
            })
            .collect();
        Self {
            records,
            subjects,
            today,
        }
    }

    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn sex(&self, subject_id: SubjectId) -> Result<Sex, TableError> {
        self.subject(subject_id).map(|row| row.sex)
    }

    /// Age in whole years on the evaluation date.
    pub fn chronological_age(&self, subject_id: SubjectId) -> Result<u32, TableError> {
        let row = self.subject(subject_id)?;
        self.today
            .years_since(row.birth_date)
            .ok_or(TableError::BirthAfterEvaluation {
                subject_id,
                birth_date: row.birth_date,
                today: self.today,
            })
    }

    fn subject(&self, subject_id: SubjectId) -> Result<&SubjectRow, TableError> {
        self.subjects
            .get(&subject_id)
            .ok_or(TableError::UnknownSubject(subject_id))
    }

    /// The most recent value of every biomarker the subject has. Later rows win ties.
    pub fn latest_panel(&self, subject_id: SubjectId) -> Result<Panel, TableError> {
        let latest = self
            .records
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .into_grouping_map_by(|r| r.biomarker)
            .max_by_key(|_, r| r.taken_at);
        Ok(Panel::from_measurements(
            latest.into_values().map(|r| r.measurement()),
        )?)
    }
}

impl MeasurementSupplier for MeasurementTable {
    type Error = TableError;

    fn latest_snapshot(&self, subject_id: SubjectId) -> Result<SubjectSnapshot, Self::Error> {
        let sex = self.sex(subject_id)?;
        let age = self.chronological_age(subject_id)?;
        let panel = self.latest_panel(subject_id)?;
        Ok(SubjectSnapshot {
            subject_id,
            chronological_age: f64::from(age),
            sex,
            panel,
        })
    }
}

// ========================================================================================
//                                    RESULT LOG
// ========================================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ResultRow {
    subject_id: u32,
    model_name: ModelKind,
    bio_age_years: f64,
    age_gap: f64,
    computed_at: DateTime<Utc>,
}

/// Append-only TSV of every stored result.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A subject's stored results, newest first, optionally limited to one model.
    pub fn history(
        &self,
        subject_id: SubjectId,
        model: Option<ModelKind>,
    ) -> Result<Vec<BioAgeResult>, TableError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = open_reader(&self.path, b'\t', true)?;
        let mut results = Vec::new();
        for row in reader.deserialize::<ResultRow>() {
            let row = row.map_err(csv_error(&self.path))?;
            if row.subject_id != subject_id.0 || model.is_some_and(|m| m != row.model_name) {
                continue;
            }
            results.push(BioAgeResult {
                model_name: row.model_name,
                bio_age_years: row.bio_age_years,
                age_gap: row.age_gap,
                computed_at: row.computed_at,
            });
        }
        results.sort_by(|a, b| b.computed_at.cmp(&a.computed_at));
        Ok(results)
    }
}

impl ResultSink for ResultLog {
    type Error = TableError;

    fn submit(&self, subject_id: SubjectId, result: &BioAgeResult) -> Result<(), Self::Error> {
        let io_error = |source| TableError::Io {
            path: self.path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error)?;
        let is_new = file.metadata().map_err(io_error)?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(is_new)
            .from_writer(file);
        writer
            .serialize(ResultRow {
                subject_id: subject_id.0,
                model_name: result.model_name,
                bio_age_years: result.bio_age_years,
                age_gap: result.age_gap,
                computed_at: result.computed_at,
            })
            .map_err(csv_error(&self.path))?;
        writer.flush().map_err(io_error)?;
        Ok(())
    }
}
