//! Optional `bioage.toml` naming the data files the CLI works with.
//!
//! Every field has a default, so an empty file (or no file at all) is valid.
//! Command-line flags override whatever the file says.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "bioage.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BioageConfig {
    /// Reference population TSV used to fit the HD model.
    pub cohort: PathBuf,
    /// Saved HD fit.
    pub hd_fit: PathBuf,
    /// Measurement history TSV.
    pub measurements: PathBuf,
    /// Subject demographics TSV.
    pub subjects: PathBuf,
    /// Append-only results TSV.
    pub results: PathBuf,
    /// Reference band CSV. The built-in table is used when unset.
    pub reference_ranges: Option<PathBuf>,
}

impl Default for BioageConfig {
    fn default() -> Self {
        Self {
            cohort: PathBuf::from("reference_cohort.tsv"),
            hd_fit: PathBuf::from("hd_fit.toml"),
            measurements: PathBuf::from("measurements.tsv"),
            subjects: PathBuf::from("subjects.tsv"),
            results: PathBuf::from("results.tsv"),
            reference_ranges: None,
        }
    }
}

impl BioageConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `explicit` if given (it must exist), otherwise `bioage.toml` from the
    /// working directory if present, otherwise the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    log::info!("Using configuration from '{DEFAULT_CONFIG_FILE}'");
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}
