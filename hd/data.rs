//! # Reference Cohort Loading
//!
//! Reads a tab-separated reference population (for example an NHANES extract) into a
//! `ReferenceCohort`.
//!
//! - Strict Schema: one column per biomarker, named by its panel key (`albumin`,
//!   `alkaline_phosphatase`, `creatinine`, `fasting_glucose`, `crp`, `wbc`,
//!   `lymphocyte_pct`, `mcv`, `rdw`). Optional `age` (years) and `sex` columns.
//! - Units: values are read in storage units and converted to model units here, so
//!   fasting glucose arrives in mg/dL and leaves in mmol/L.
//! - Missing values: empty biomarker cells are allowed and carried as `None`. The fit
//!   drops incomplete rows and reports how many it dropped. Non-numeric or non-finite
//!   values are errors.

use super::fit::{CohortRow, ReferenceCohort};
use crate::types::{Biomarker, PANEL_SIZE, Sex};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const AGE_COLUMN: &str = "age";
const SEX_COLUMN: &str = "sex";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the cohort file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. Leave the cell empty to mark a missing value."
    )]
    NonFiniteValuesFound(String),
    #[error("Invalid value '{value}' in column '{column_name}' at data row {row}.")]
    InvalidValue {
        column_name: String,
        row: usize,
        value: String,
    },
}

/// Loads a reference cohort from a TSV file.
pub fn load_reference_cohort(path: &str) -> Result<ReferenceCohort, DataError> {
    log::info!("Loading reference cohort from '{path}'");

    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for biomarker in Biomarker::ALL {
        if !columns.contains(biomarker.key()) {
            return Err(DataError::ColumnNotFound(biomarker.key().to_string()));
        }
    }

    let height = df.height();
    let mut panel_columns: Vec<Vec<Option<f64>>> = Vec::with_capacity(PANEL_SIZE);
    for biomarker in Biomarker::ALL {
        let column = extract_optional_numeric(&df, biomarker.key())?
            .into_iter()
            .map(|value| value.map(|v| biomarker.to_model_units(v)))
            .collect();
        panel_columns.push(column);
    }

    let ages = if columns.contains(AGE_COLUMN) {
        extract_optional_numeric(&df, AGE_COLUMN)?
    } else {
        log::info!("No '{AGE_COLUMN}' column; HD scores will not be calibrated to years");
        vec![None; height]
    };
    let sexes = if columns.contains(SEX_COLUMN) {
        extract_sex(&df)?
    } else {
        vec![None; height]
    };

    let rows: Vec<CohortRow> = (0..height)
        .map(|i| {
            let mut values = [None; PANEL_SIZE];
            for (dst, column) in values.iter_mut().zip(panel_columns.iter()) {
                *dst = column[i];
            }
            CohortRow {
                values,
                age: ages[i],
                sex: sexes[i],
            }
        })
        .collect();

    let complete = rows.iter().filter(|r| r.complete_values().is_some()).count();
    log::info!(
        "Loaded {height} cohort rows ({complete} complete, {} with missing biomarkers)",
        height - complete
    );
    Ok(ReferenceCohort::new(rows))
}

fn extract_optional_numeric(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let series = df.column(column_name)?;
    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };

    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    // A cast that introduces new nulls means some cell was not a number.
    if casted.null_count() > series.null_count() {
        return Err(wrong_type());
    }

    let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
    if values.iter().flatten().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

/// Reads the sex column. Accepts `M`/`F` (any case, long forms too) and the NHANES
/// coding `1` = male, `2` = female. Empty cells are `None`.
fn extract_sex(df: &DataFrame) -> Result<Vec<Option<Sex>>, DataError> {
    let series = df.column(SEX_COLUMN)?;
    let as_text = series
        .cast(&DataType::String)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: SEX_COLUMN.to_string(),
            expected_type: "M/F or 1/2",
            found_type: format!("{:?}", series.dtype()),
        })?;

    as_text
        .str()?
        .into_iter()
        .enumerate()
        .map(|(i, cell)| match cell.map(str::trim) {
            None | Some("") => Ok(None),
            Some("1.0") => Ok(Some(Sex::Male)),
            Some("2.0") => Ok(Some(Sex::Female)),
            Some(text) => text.parse::<Sex>().map(Some).map_err(|_| DataError::InvalidValue {
                column_name: SEX_COLUMN.to_string(),
                row: i + 1,
                value: text.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str =
        "albumin\talkaline_phosphatase\tcreatinine\tfasting_glucose\tcrp\twbc\tlymphocyte_pct\tmcv\trdw";

    fn write_tsv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_and_converts_glucose() {
        let file = write_tsv(&format!(
            "{HEADER}\tage\tsex\n\
             4.2\t85\t0.9\t90\t1.2\t6.5\t30\t90\t13\t45\tM\n\
             4.0\t70\t1.1\t\t2.0\t7.0\t25\t92\t14\t\t2\n"
        ));
        let cohort = load_reference_cohort(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cohort.len(), 2);

        let first = &cohort.rows()[0];
        assert_abs_diff_eq!(
            first.values[Biomarker::FastingGlucose.index()].unwrap(),
            5.0,
            epsilon = 1e-12
        );
        assert_eq!(first.age, Some(45.0));
        assert_eq!(first.sex, Some(Sex::Male));

        let second = &cohort.rows()[1];
        assert_eq!(second.values[Biomarker::FastingGlucose.index()], None);
        assert!(second.complete_values().is_none());
        assert_eq!(second.age, None);
        assert_eq!(second.sex, Some(Sex::Female));
    }

    #[test]
    fn age_and_sex_are_optional() {
        let file = write_tsv(&format!("{HEADER}\n4.2\t85\t0.9\t90\t1.2\t6.5\t30\t90\t13\n"));
        let cohort = load_reference_cohort(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cohort.rows()[0].age, None);
        assert_eq!(cohort.rows()[0].sex, None);
    }

    #[test]
    fn missing_biomarker_column_is_reported() {
        let file = write_tsv("albumin\tcreatinine\n4.2\t0.9\n");
        match load_reference_cohort(file.path().to_str().unwrap()) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "alkaline_phosphatase"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn text_in_a_numeric_column_is_rejected() {
        let file = write_tsv(&format!(
            "{HEADER}\n4.2\t85\t0.9\t90\thigh\t6.5\t30\t90\t13\n"
        ));
        assert!(matches!(
            load_reference_cohort(file.path().to_str().unwrap()),
            Err(DataError::ColumnWrongType { ref column_name, .. }) if column_name == "crp"
        ));
    }
}
