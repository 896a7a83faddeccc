#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use chrono::{Local, NaiveDate};
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use bioage::config::BioageConfig;
use bioage::engine::{BioAgeEngine, CohortSupplier, ModelSelection};
use bioage::hd::{HdFit, HdModel};
use bioage::io::{CohortFile, MeasurementTable, ResultLog, load_reference_bands};
use bioage::ranges::{RangeSelection, ReferenceTable, ValueRange};
use bioage::trend::{DEFAULT_TREND_LIMIT, DEFAULT_TREND_RANGE, TrendRange, trend_series};
use bioage::types::{Biomarker, ModelKind, SubjectId};

/// File locations shared by every subcommand. Flags override `bioage.toml`.
#[derive(Args)]
struct DataArgs {
    /// Configuration file (defaults to ./bioage.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Measurement history TSV (subject_id, taken_at, biomarker_id, value)
    #[arg(long, global = true, value_name = "PATH")]
    measurements: Option<PathBuf>,

    /// Subject TSV (subject_id, birth_date, sex)
    #[arg(long, global = true, value_name = "PATH")]
    subjects: Option<PathBuf>,

    /// Append-only results TSV
    #[arg(long, global = true, value_name = "PATH")]
    results: Option<PathBuf>,

    /// Saved HD fit (.toml)
    #[arg(long, global = true, value_name = "PATH")]
    hd_fit: Option<PathBuf>,

    /// Reference band CSV; the built-in table is used when omitted
    #[arg(long, global = true, value_name = "PATH")]
    reference_ranges: Option<PathBuf>,
}

impl DataArgs {
    fn resolve(&self) -> Result<BioageConfig, Box<dyn std::error::Error>> {
        let mut config = BioageConfig::resolve(self.config.as_deref())?;
        if let Some(path) = &self.measurements {
            config.measurements = path.clone();
        }
        if let Some(path) = &self.subjects {
            config.subjects = path.clone();
        }
        if let Some(path) = &self.results {
            config.results = path.clone();
        }
        if let Some(path) = &self.hd_fit {
            config.hd_fit = path.clone();
        }
        if let Some(path) = &self.reference_ranges {
            config.reference_ranges = Some(path.clone());
        }
        Ok(config)
    }
}

#[derive(Parser)]
#[command(
    name = "bioage",
    about = "Biological age estimation from a nine-biomarker blood panel",
    long_about = "Computes Phenotypic Age and Homeostatic Dysregulation estimates from a \
                 subject's latest blood panel, classifies each biomarker against clinical \
                 and longevity reference ranges, and reports biomarker trends."
)]
struct Cli {
    #[command(flatten)]
    data: DataArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the HD model to a reference population and save the fit
    #[command(about = "Fit the Homeostatic Dysregulation model (outputs: hd_fit.toml)")]
    FitHd {
        /// Reference cohort TSV with one column per biomarker key, optional age and sex
        #[arg(value_name = "COHORT_PATH")]
        cohort: Option<PathBuf>,
    },

    /// Compute biological age for a subject and store the results
    #[command(about = "Compute biological age for one subject")]
    Score {
        #[arg(value_name = "SUBJECT_ID")]
        subject: u32,

        /// Model to run: 'all', 'phenotypic' or 'hd'
        #[arg(long, default_value = "all")]
        model: ModelSelection,

        /// Evaluation date for chronological age (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<NaiveDate>,
    },

    /// Classify a subject's latest panel against the reference ranges
    #[command(about = "Classify each biomarker as Optimal, Normal or Out of Range")]
    Classify {
        #[arg(value_name = "SUBJECT_ID")]
        subject: u32,

        /// Ranges to display: 'both', 'clinical' or 'longevity'
        #[arg(long, default_value = "both")]
        ranges: RangeSelection,

        /// Evaluation date (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<NaiveDate>,
    },

    /// Show one biomarker's recent history for a subject
    #[command(about = "Show a biomarker trend, newest first")]
    Trend {
        #[arg(value_name = "SUBJECT_ID")]
        subject: u32,

        /// Biomarker id (1-9) or key, e.g. 'crp'
        #[arg(value_name = "BIOMARKER", value_parser = parse_biomarker)]
        biomarker: Biomarker,

        /// Lookback window, e.g. '6 months'
        #[arg(long, default_value = DEFAULT_TREND_RANGE)]
        range: TrendRange,

        /// Maximum number of points
        #[arg(long, default_value_t = DEFAULT_TREND_LIMIT)]
        limit: usize,

        /// Window end date (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<NaiveDate>,
    },

    /// List stored biological-age results for a subject, newest first
    #[command(about = "Show stored biological-age results")]
    History {
        #[arg(value_name = "SUBJECT_ID")]
        subject: u32,

        /// Only show results from this model
        #[arg(long)]
        model: Option<ModelKind>,
    },

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn parse_biomarker(text: &str) -> Result<Biomarker, String> {
    if let Ok(id) = text.trim().parse::<u8>() {
        return Biomarker::try_from(id).map_err(|e| e.to_string());
    }
    Biomarker::from_key(text).ok_or_else(|| {
        let keys: Vec<&str> = Biomarker::ALL.iter().map(|b| b.key()).collect();
        format!("Unknown biomarker '{text}'. Expected an id 1-9 or one of: {}", keys.join(", "))
    })
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let Cli { data, command } = cli;

    let result = match command {
        Some(Commands::FitHd { cohort }) => run_fit_hd(&data, cohort),
        Some(Commands::Score {
            subject,
            model,
            date,
        }) => run_score(&data, SubjectId(subject), model, date),
        Some(Commands::Classify {
            subject,
            ranges,
            date,
        }) => run_classify(&data, SubjectId(subject), ranges, date),
        Some(Commands::Trend {
            subject,
            biomarker,
            range,
            limit,
            date,
        }) => run_trend(&data, SubjectId(subject), biomarker, range, limit, date),
        Some(Commands::History { subject, model }) => run_history(&data, SubjectId(subject), model),
        Some(Commands::Version) => {
            println!("bioage {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_measurements(
    config: &BioageConfig,
    date: Option<NaiveDate>,
) -> Result<MeasurementTable, Box<dyn std::error::Error>> {
    let today = date.unwrap_or_else(|| Local::now().date_naive());
    Ok(MeasurementTable::load(&config.measurements, &config.subjects, today)?)
}

fn load_hd_model(path: &Path) -> Result<HdModel, Box<dyn std::error::Error>> {
    if !path.exists() {
        log::info!("No HD fit at '{}'; the HD model is unfit", path.display());
        return Ok(HdModel::new());
    }
    let fit = HdFit::load(&path.to_string_lossy())?;
    log::info!("Loaded HD fit ({} reference individuals)", fit.reference_n);
    Ok(HdModel::from_fit(fit))
}

fn run_fit_hd(data: &DataArgs, cohort: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = data.resolve()?;
    let cohort_path = cohort.unwrap_or(config.cohort);
    let reference = CohortFile::new(&cohort_path).reference_cohort()?;

    let model = HdModel::new();
    let fit = model.fit(&reference)?;
    fit.save(&config.hd_fit.to_string_lossy())?;

    println!(
        "HD model fit on {} of {} individuals (condition number {:.3e})",
        fit.reference_n,
        reference.len(),
        fit.condition_number
    );
    match fit.age_calibration {
        Some(cal) => println!(
            "HD-to-age conversion: HD_years = {:.4} * HD_score + {:.4} (n = {})",
            cal.slope, cal.intercept, cal.n
        ),
        None => println!("No age calibration: the cohort carried fewer than two usable ages"),
    }
    println!("Fit saved to {}", config.hd_fit.display());
    Ok(())
}

fn run_score(
    data: &DataArgs,
    subject: SubjectId,
    model: ModelSelection,
    date: Option<NaiveDate>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = data.resolve()?;
    let measurements = load_measurements(&config, date)?;
    let hd = Arc::new(load_hd_model(&config.hd_fit)?);
    let engine = BioAgeEngine::new(measurements, ResultLog::new(&config.results), hd);

    let report = engine.calculate(subject, model)?;
    println!(
        "Subject {} (chronological age {:.0})",
        report.subject_id, report.chronological_age
    );
    for result in &report.results {
        println!(
            "  {:<28} {:>7.2} years  (gap {:+.2})",
            result.model_name.name(),
            result.bio_age_years,
            result.age_gap
        );
    }
    for (kind, reason) in &report.unavailable {
        println!("  {:<28} unavailable: {reason}", kind.name());
    }
    println!("Results appended to {}", config.results.display());
    Ok(())
}

fn run_classify(
    data: &DataArgs,
    subject: SubjectId,
    ranges: RangeSelection,
    date: Option<NaiveDate>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = data.resolve()?;
    let table = match &config.reference_ranges {
        Some(path) => load_reference_bands(path)?,
        None => ReferenceTable::standard(),
    };
    let measurements = load_measurements(&config, date)?;
    let sex = measurements.sex(subject)?;
    let panel = measurements.latest_panel(subject)?;

    println!("Subject {subject} ({sex})");
    for row in table.classify_panel(&panel, sex, ranges) {
        let show = |range: Option<ValueRange>| {
            range.map_or_else(|| "-".to_string(), |r| r.to_string())
        };
        println!(
            "  {:<28} {:>9} {:<14} {:<13} clinical {:<12} longevity {}",
            row.biomarker.name(),
            row.value,
            row.biomarker.unit(),
            row.status.to_string(),
            show(row.clinical_range),
            show(row.longevity_range)
        );
    }
    Ok(())
}

fn run_trend(
    data: &DataArgs,
    subject: SubjectId,
    biomarker: Biomarker,
    range: TrendRange,
    limit: usize,
    date: Option<NaiveDate>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = data.resolve()?;
    let measurements = load_measurements(&config, date)?;
    let points = trend_series(
        measurements.records(),
        subject,
        biomarker,
        &range,
        limit,
        measurements.today(),
    );

    println!(
        "{} ({}) for subject {subject}, last {range}:",
        biomarker.name(),
        biomarker.unit()
    );
    if points.is_empty() {
        println!("  no measurements in this window");
    }
    for point in points {
        println!("  {}  {}", point.taken_at, point.value);
    }
    Ok(())
}

fn run_history(
    data: &DataArgs,
    subject: SubjectId,
    model: Option<ModelKind>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = data.resolve()?;
    let history = ResultLog::new(&config.results).history(subject, model)?;
    if history.is_empty() {
        println!("No stored results for subject {subject}");
    }
    for result in history {
        println!(
            "{}  {:<28} {:>7.2} years  (gap {:+.2})",
            result.computed_at.format("%Y-%m-%d %H:%M:%S"),
            result.model_name.name(),
            result.bio_age_years,
            result.age_gap
        );
    }
    Ok(())
}
