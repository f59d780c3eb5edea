use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::logging::log_event;

/// Discrete steps of a table run. Each one fails independently with its own context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ListTables,
    CreateDirectory,
    LoadTable,
    WriteRaw,
    Split,
    WriteSplits,
    ReadSplits,
    Indicators,
    Labels,
    BuildPreprocessor,
    SavePreprocessorPipeline,
    FitTransform,
    SavePreprocessor,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ListTables => "list_tables",
            Step::CreateDirectory => "create_directory",
            Step::LoadTable => "load_table",
            Step::WriteRaw => "write_raw",
            Step::Split => "split",
            Step::WriteSplits => "write_splits",
            Step::ReadSplits => "read_splits",
            Step::Indicators => "indicators",
            Step::Labels => "labels",
            Step::BuildPreprocessor => "build_preprocessor",
            Step::SavePreprocessorPipeline => "save_preprocessor_pipeline",
            Step::FitTransform => "fit_transform",
            Step::SavePreprocessor => "save_preprocessor",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error kind surfaced by a pipeline run: the originating failure plus the
/// table, step and source location it happened at.
#[derive(Debug, Error)]
#[error(
    "{step} failed for table `{table}` at {}:{}: {source:#}",
    .location.file(),
    .location.line()
)]
pub struct PipelineError {
    pub table: String,
    pub step: Step,
    pub location: &'static Location<'static>,
    #[source]
    pub source: anyhow::Error,
}

impl PipelineError {
    #[track_caller]
    pub fn new(table: impl Into<String>, step: Step, source: impl Into<anyhow::Error>) -> Self {
        let error = Self {
            table: table.into(),
            step,
            location: Location::caller(),
            source: source.into(),
        };

        log_event(
            error.location.file(),
            "PipelineError",
            step.as_str(),
            "pipeline.error",
            error.location.line(),
            &format!("Step {step} aborted the run"),
            Some(&format!("{:#}", error.source)),
            Some(&error.table),
        );

        error
    }
}

/// Attach table and step context to any fallible result.
pub trait StepContext<T> {
    fn step(self, table: &str, step: Step) -> Result<T, PipelineError>;
}

impl<T, E> StepContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    #[track_caller]
    fn step(self, table: &str, step: Step) -> Result<T, PipelineError> {
        match self {
            Ok(value) => Ok(value),
            Err(source) => Err(PipelineError::new(table, step, source)),
        }
    }
}

/// Whether `error` was already written to the log when it was raised.
pub fn is_logged(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<PipelineError>())
}
