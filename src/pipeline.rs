//! Per-table orchestration: load, split, persist, derive indicators and labels, then fit the
//! preprocessor on training features and apply it to both splits.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use polars::prelude::*;

use crate::artifacts::{
    ArtifactResult, ArtifactStore, TableArtifacts, load_obj, read_csv_with_dtypes, save_obj,
    write_csv,
};
use crate::calendar::{GREGORIAN_COLUMN, with_normalized_dates};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Step, StepContext};
use crate::indicators::{INDICATOR_COLUMNS, with_indicators};
use crate::labels::with_labels;
use crate::logging::log_event;
use crate::preprocess::{FittedPreprocessor, Preprocessor};
use crate::schema::{ColumnRole, SchemaError, TableSchema, coerce_identifiers};
use crate::source::TableSource;
use crate::split::train_test_split;

/// Everything one run needs, constructed once and passed to every step.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: PipelineConfig,
    pub store: ArtifactStore,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(config: PipelineConfig) -> Self {
        let store = ArtifactStore::new(config.artifact_root.clone());
        Self {
            config,
            store,
            started_at: Utc::now(),
        }
    }
}

/// Result of processing one table: transformed splits with the label as last column.
#[derive(Debug, Clone)]
pub struct TableOutcome {
    pub table: String,
    pub artifacts: TableArtifacts,
    pub train: DataFrame,
    pub test: DataFrame,
    pub preprocessor: FittedPreprocessor,
}

/// Column roles used to build the preprocessor: the raw table's columns (declared roles
/// applied), without the label, plus the derived indicator columns.
pub fn feature_schema(
    raw: &DataFrame,
    config: &PipelineConfig,
    table: &str,
) -> Result<TableSchema, SchemaError> {
    let mut schema = match config.declared_schema(table) {
        Some(declared) => TableSchema::with_declared(raw, &config.identifier_markers, declared)?,
        None => TableSchema::infer(raw, &config.identifier_markers),
    };
    schema.remove(&config.label_column);
    for column in INDICATOR_COLUMNS {
        schema.insert(column, ColumnRole::Numerical);
    }
    Ok(schema)
}

/// Splits are read back with the raw table's column types so identifier and Jalali date
/// strings come back verbatim.
fn read_split(path: &Path, raw: &DataFrame) -> ArtifactResult<DataFrame> {
    read_csv_with_dtypes(path, &raw.schema())
}

fn append_label(
    transformed: &mut DataFrame,
    labelled: &DataFrame,
    label_column: &str,
) -> PolarsResult<()> {
    let label = labelled.column(label_column)?.clone();
    transformed.with_column(label)?;
    Ok(())
}

/// Run every step for `table`. The first failing step aborts with its context.
pub fn process_table<S: TableSource>(
    context: &RunContext,
    source: &mut S,
    table: &str,
) -> Result<TableOutcome, PipelineError> {
    let config = &context.config;

    let artifacts = context
        .store
        .ensure_table_dir(table)
        .step(table, Step::CreateDirectory)?;

    let raw = source.load_table(table).step(table, Step::LoadTable)?;
    write_csv(&raw, &artifacts.raw).step(table, Step::WriteRaw)?;

    let (train, test) =
        train_test_split(&raw, config.test_size, config.seed, table).step(table, Step::Split)?;
    write_csv(&train, &artifacts.train).step(table, Step::WriteSplits)?;
    write_csv(&test, &artifacts.test).step(table, Step::WriteSplits)?;

    let train = read_split(&artifacts.train, &raw).step(table, Step::ReadSplits)?;
    let test = read_split(&artifacts.test, &raw).step(table, Step::ReadSplits)?;

    let train = with_indicators(&train, &config.price_column, table).step(table, Step::Indicators)?;
    let test = with_indicators(&test, &config.price_column, table).step(table, Step::Indicators)?;

    // Thresholds come from each split's own band quantiles.
    let train = with_labels(&train, &config.label_column, table).step(table, Step::Labels)?;
    let test = with_labels(&test, &config.label_column, table).step(table, Step::Labels)?;

    let schema = feature_schema(&raw, config, table).step(table, Step::BuildPreprocessor)?;
    let preprocessor = Preprocessor::from_schema(&schema, config.unknown_categories)
        .step(table, Step::BuildPreprocessor)?;
    log_event(
        file!(),
        "Pipeline",
        "process_table",
        "pipeline.build",
        line!(),
        &format!(
            "Numerical features: [{}]; categorical features: [{}]",
            preprocessor.numerical.join(", "),
            preprocessor.categorical.join(", ")
        ),
        None,
        Some(table),
    );
    save_obj(&artifacts.preprocessor_pipeline, &preprocessor)
        .step(table, Step::SavePreprocessorPipeline)?;

    let fit_transform = || -> anyhow::Result<(FittedPreprocessor, DataFrame, DataFrame)> {
        let train_features = train.drop(&config.label_column)?;
        let test_features = test.drop(&config.label_column)?;

        let (fitted, mut train_out) = preprocessor.fit_transform(&train_features)?;
        let mut test_out = fitted.transform(&test_features)?;

        append_label(&mut train_out, &train, &config.label_column)?;
        append_label(&mut test_out, &test, &config.label_column)?;
        Ok((fitted, train_out, test_out))
    };
    let (fitted, train_out, test_out) = fit_transform().step(table, Step::FitTransform)?;

    save_obj(&artifacts.preprocessor, &fitted).step(table, Step::SavePreprocessor)?;

    log_event(
        file!(),
        "Pipeline",
        "process_table",
        "pipeline.table",
        line!(),
        &format!(
            "Transformed {} train and {} test rows into {} features",
            train_out.height(),
            test_out.height(),
            fitted.n_features()
        ),
        None,
        Some(table),
    );

    Ok(TableOutcome {
        table: table.to_string(),
        artifacts,
        train: train_out,
        test: test_out,
        preprocessor: fitted,
    })
}

/// Process every table the source lists, in order. The run stops at the first failure.
pub fn run<S: TableSource>(
    context: &RunContext,
    source: &mut S,
) -> Result<Vec<TableOutcome>, PipelineError> {
    let tables = source.list_tables().step("*", Step::ListTables)?;

    let mut outcomes = Vec::with_capacity(tables.len());
    for table in &tables {
        outcomes.push(process_table(context, source, table)?);
    }

    let elapsed = Utc::now() - context.started_at;
    log_event(
        file!(),
        "Pipeline",
        "run",
        "pipeline.run",
        line!(),
        &format!(
            "Processed {} tables in {} ms",
            outcomes.len(),
            elapsed.num_milliseconds()
        ),
        None,
        None,
    );

    Ok(outcomes)
}

/// Apply the persisted fitted preprocessor of `table` to new rows without refitting.
/// Identifier coercion, date normalization and indicators are derived as during the run.
pub fn transform_new_rows(
    context: &RunContext,
    table: &str,
    frame: &DataFrame,
) -> anyhow::Result<DataFrame> {
    let config = &context.config;
    let artifacts = context.store.table(table);
    let fitted: FittedPreprocessor = load_obj(&artifacts.preprocessor)?;

    let mut prepared = coerce_identifiers(frame, &config.identifier_markers)?;
    let has_column = |frame: &DataFrame, name: &str| frame.column(name).is_ok();
    if has_column(&prepared, &config.date_column) && !has_column(&prepared, GREGORIAN_COLUMN) {
        prepared = with_normalized_dates(&prepared, &config.date_column)?;
    }
    let prepared = with_indicators(&prepared, &config.price_column, table)?;

    let transformed = fitted
        .transform(&prepared)
        .with_context(|| format!("failed to transform new rows for table `{table}`"))?;

    log_event(
        file!(),
        "Pipeline",
        "transform_new_rows",
        "pipeline.inference",
        line!(),
        &format!(
            "Transformed {} new rows with {}",
            transformed.height(),
            artifacts.preprocessor.display()
        ),
        None,
        Some(table),
    );

    Ok(transformed)
}
