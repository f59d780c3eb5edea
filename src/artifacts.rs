//! Per-table artifact directory: raw/train/test CSV copies and serialized preprocessors.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::logging::log_event;

pub const RAW_FILE: &str = "raw.csv";
pub const TRAIN_FILE: &str = "train.csv";
pub const TEST_FILE: &str = "test.csv";
pub const PREPROCESSOR_PIPELINE_FILE: &str = "preprocessor_pipeline.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to write csv {path}: {source}")]
    WriteCsv { path: PathBuf, source: PolarsError },
    #[error("failed to read csv {path}: {source}")]
    ReadCsv { path: PathBuf, source: PolarsError },
    #[error("failed to serialize {path}: {source}")]
    Serialize { path: PathBuf, source: serde_json::Error },
    #[error("failed to deserialize {path}: {source}")]
    Deserialize { path: PathBuf, source: serde_json::Error },
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Paths of every artifact kept for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableArtifacts {
    pub dir: PathBuf,
    pub raw: PathBuf,
    pub train: PathBuf,
    pub test: PathBuf,
    pub preprocessor_pipeline: PathBuf,
    pub preprocessor: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table(&self, table: &str) -> TableArtifacts {
        let dir = self.root.join(table);
        TableArtifacts {
            raw: dir.join(RAW_FILE),
            train: dir.join(TRAIN_FILE),
            test: dir.join(TEST_FILE),
            preprocessor_pipeline: dir.join(PREPROCESSOR_PIPELINE_FILE),
            preprocessor: dir.join(PREPROCESSOR_FILE),
            dir,
        }
    }

    /// Create the table directory (and the root) if missing.
    pub fn ensure_table_dir(&self, table: &str) -> ArtifactResult<TableArtifacts> {
        let artifacts = self.table(table);
        fs::create_dir_all(&artifacts.dir).map_err(|source| ArtifactError::CreateDir {
            path: artifacts.dir.clone(),
            source,
        })?;

        log_event(
            file!(),
            "ArtifactStore",
            "ensure_table_dir",
            "artifacts.directory",
            line!(),
            &format!("Created {}", artifacts.dir.display()),
            None,
            Some(table),
        );

        Ok(artifacts)
    }
}

pub fn write_csv(frame: &DataFrame, path: &Path) -> ArtifactResult<()> {
    let file = File::create(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut frame = frame.clone();
    CsvWriter::new(BufWriter::new(file))
        .finish(&mut frame)
        .map_err(|source| ArtifactError::WriteCsv {
            path: path.to_path_buf(),
            source,
        })?;

    log_event(
        file!(),
        "ArtifactStore",
        "write_csv",
        "artifacts.write",
        line!(),
        &format!("Stored {} rows into {}", frame.height(), path.display()),
        None,
        None,
    );

    Ok(())
}

/// Read a CSV artifact. Text columns stay text: Jalali dates such as `1402/02/31` must not be
/// reinterpreted as Gregorian ones.
pub fn read_csv(path: &Path) -> ArtifactResult<DataFrame> {
    scan_csv(path, None)
}

/// Read a CSV artifact with the column types of `dtypes` instead of inferred ones. Columns
/// absent from `dtypes` are inferred.
pub fn read_csv_with_dtypes(path: &Path, dtypes: &Schema) -> ArtifactResult<DataFrame> {
    scan_csv(path, Some(dtypes))
}

fn scan_csv(path: &Path, dtypes: Option<&Schema>) -> ArtifactResult<DataFrame> {
    let to_error = |source| ArtifactError::ReadCsv {
        path: path.to_path_buf(),
        source,
    };
    let frame = LazyCsvReader::new(path)
        .has_header(true)
        .with_try_parse_dates(false)
        .with_infer_schema_length(Some(2048))
        .with_dtype_overwrite(dtypes)
        .finish()
        .and_then(|lazy| lazy.collect())
        .map_err(to_error)?;

    log_event(
        file!(),
        "ArtifactStore",
        "read_csv",
        "artifacts.read",
        line!(),
        &format!("Loaded {} rows from {}", frame.height(), path.display()),
        None,
        None,
    );

    Ok(frame)
}

pub fn save_obj<T: Serialize>(path: &Path, obj: &T) -> ArtifactResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ArtifactError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), obj).map_err(|source| {
        ArtifactError::Serialize {
            path: path.to_path_buf(),
            source,
        }
    })?;

    log_event(
        file!(),
        "ArtifactStore",
        "save_obj",
        "artifacts.write",
        line!(),
        &format!("Stored {} into {}", std::any::type_name::<T>(), path.display()),
        None,
        None,
    );

    Ok(())
}

pub fn load_obj<T: DeserializeOwned>(path: &Path) -> ArtifactResult<T> {
    let file = File::open(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let obj = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
        ArtifactError::Deserialize {
            path: path.to_path_buf(),
            source,
        }
    })?;

    log_event(
        file!(),
        "ArtifactStore",
        "load_obj",
        "artifacts.read",
        line!(),
        &format!("Loaded {} from {}", std::any::type_name::<T>(), path.display()),
        None,
        None,
    );

    Ok(obj)
}
