use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;
use crate::preprocess::UnknownCategory;
use crate::schema::ColumnRole;
use crate::source::SourceOptions;

pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("no database url configured; set DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub artifact_root: PathBuf,
    /// Tables whose name contains any of these substrings are skipped.
    pub excluded_table_patterns: Vec<String>,
    /// Columns whose name contains any of these substrings are identifiers.
    pub identifier_markers: Vec<String>,
    pub price_column: String,
    pub date_column: String,
    pub label_column: String,
    pub test_size: f64,
    pub seed: u64,
    pub unknown_categories: UnknownCategory,
    /// Declared column roles per table, applied over the inferred ones.
    pub schemas: BTreeMap<String, BTreeMap<String, ColumnRole>>,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let source = SourceOptions::default();
        Self {
            database_url: None,
            artifact_root: PathBuf::from(".artifacts"),
            excluded_table_patterns: source.excluded_table_patterns,
            identifier_markers: source.identifier_markers,
            price_column: "close_price".to_string(),
            date_column: source.date_column,
            label_column: "label".to_string(),
            test_size: 0.2,
            seed: 102,
            unknown_categories: UnknownCategory::default(),
            schemas: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Optional JSON file, then `.env` and the process environment for the database url.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Ok(url) = env::var(DATABASE_URL_VAR)
            && !url.trim().is_empty()
        {
            config.database_url = Some(url);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "test_size must lie strictly between 0 and 1, got {}",
                self.test_size
            )));
        }
        if self.price_column.trim().is_empty() {
            return Err(ConfigError::Invalid("price_column must not be empty".to_string()));
        }
        if self.label_column.trim().is_empty() {
            return Err(ConfigError::Invalid("label_column must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            excluded_table_patterns: self.excluded_table_patterns.clone(),
            identifier_markers: self.identifier_markers.clone(),
            date_column: self.date_column.clone(),
        }
    }

    pub fn declared_schema(&self, table: &str) -> Option<&BTreeMap<String, ColumnRole>> {
        self.schemas.get(table)
    }
}
