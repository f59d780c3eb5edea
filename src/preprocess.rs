//! Column-wise preprocessing: imputation, one-hot encoding and scaling routed over the
//! numerical and categorical columns of a table.
//!
//! A [`Preprocessor`] describes the shape of the pipeline and holds no learned state. Fitting
//! it on training features yields a [`FittedPreprocessor`], whose `transform` borrows it
//! immutably so applying it to held-out data can never refit or mutate learned statistics.

use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::log_event;
use crate::schema::TableSchema;

pub const NUMERIC_PREFIX: &str = "num_pipeline";
pub const CATEGORICAL_PREFIX: &str = "cat_pipeline";

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("no feature columns to preprocess")]
    NoFeatures,
    #[error("feature column `{0}` is missing")]
    MissingColumn(String),
    #[error("column `{column}` holds category `{value}` unseen during fit")]
    UnknownCategory { column: String, value: String },
    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),
}

pub type PreprocessResult<T> = Result<T, PreprocessError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputeStrategy {
    Median,
    MostFrequent,
}

/// Treatment of categories that were not seen while fitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCategory {
    /// Encode as all zeros.
    #[default]
    Ignore,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleImputer {
    pub strategy: ImputeStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub with_mean: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub handle_unknown: UnknownCategory,
}

/// Learned affine map of a scaler: `(x - offset) / scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub offset: f64,
    pub scale: f64,
}

impl ScalerState {
    pub fn apply(&self, value: f64) -> f64 {
        (value - self.offset) / self.scale
    }
}

impl StandardScaler {
    /// Population statistics; a constant column keeps unit scale.
    pub fn fit(&self, values: &[f64]) -> ScalerState {
        let len = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / len;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len;
        let std = variance.max(0.0).sqrt();

        ScalerState {
            offset: if self.with_mean { mean } else { 0.0 },
            scale: if std < 10.0 * f64::EPSILON { 1.0 } else { std },
        }
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Most common value; ties resolve to the smallest value.
pub fn most_frequent<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    let best = counts.values().copied().max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == best)
        .map(|(value, _)| value.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericPipeline {
    pub imputer: SimpleImputer,
    pub scaler: StandardScaler,
}

impl Default for NumericPipeline {
    fn default() -> Self {
        Self {
            imputer: SimpleImputer {
                strategy: ImputeStrategy::Median,
            },
            scaler: StandardScaler { with_mean: true },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalPipeline {
    pub imputer: SimpleImputer,
    pub encoder: OneHotEncoder,
    /// One-hot output is zero-anchored, so it is scaled without centering.
    pub scaler: StandardScaler,
}

impl CategoricalPipeline {
    pub fn new(handle_unknown: UnknownCategory) -> Self {
        Self {
            imputer: SimpleImputer {
                strategy: ImputeStrategy::MostFrequent,
            },
            encoder: OneHotEncoder { handle_unknown },
            scaler: StandardScaler { with_mean: false },
        }
    }
}

/// Unfitted column transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    pub numerical: Vec<String>,
    pub categorical: Vec<String>,
    pub num_pipeline: NumericPipeline,
    pub cat_pipeline: CategoricalPipeline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedNumericColumn {
    pub column: String,
    pub fill_value: f64,
    pub scaler: ScalerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedCategoricalColumn {
    pub column: String,
    pub fill_value: String,
    pub categories: Vec<String>,
    pub scalers: Vec<ScalerState>,
}

/// Column transformer with learned medians, most-frequent values, categories and scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPreprocessor {
    pub numerical: Vec<FittedNumericColumn>,
    pub categorical: Vec<FittedCategoricalColumn>,
    pub handle_unknown: UnknownCategory,
    /// Routed columns without a single defined training value; they produce no output.
    #[serde(default)]
    pub dropped: Vec<String>,
}

fn float_values(frame: &DataFrame, column: &str) -> PreprocessResult<Vec<Option<f64>>> {
    let series = frame
        .column(column)
        .map_err(|_| PreprocessError::MissingColumn(column.to_string()))?
        .cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|value| value.filter(|v| v.is_finite()))
        .collect())
}

fn string_values(frame: &DataFrame, column: &str) -> PreprocessResult<Vec<Option<String>>> {
    let series = frame
        .column(column)
        .map_err(|_| PreprocessError::MissingColumn(column.to_string()))?
        .cast(&DataType::Utf8)?;
    Ok(series
        .utf8()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

impl Preprocessor {
    /// Route the schema's numerical columns through median imputation and standard scaling,
    /// and every other column through most-frequent imputation, one-hot encoding and
    /// uncentered scaling.
    pub fn from_schema(
        schema: &TableSchema,
        handle_unknown: UnknownCategory,
    ) -> PreprocessResult<Self> {
        if schema.is_empty() {
            return Err(PreprocessError::NoFeatures);
        }

        Ok(Self {
            numerical: schema.numerical(),
            categorical: schema.categorical(),
            num_pipeline: NumericPipeline::default(),
            cat_pipeline: CategoricalPipeline::new(handle_unknown),
        })
    }

    pub fn fit(&self, features: &DataFrame) -> PreprocessResult<FittedPreprocessor> {
        let mut dropped = Vec::new();

        let mut numerical = Vec::with_capacity(self.numerical.len());
        for column in &self.numerical {
            let values = float_values(features, column)?;
            let defined: Vec<f64> = values.iter().flatten().copied().collect();
            let Some(fill_value) = median(&defined) else {
                dropped.push(column.clone());
                continue;
            };

            let imputed: Vec<f64> = values
                .into_iter()
                .map(|value| value.unwrap_or(fill_value))
                .collect();

            numerical.push(FittedNumericColumn {
                column: column.clone(),
                fill_value,
                scaler: self.num_pipeline.scaler.fit(&imputed),
            });
        }

        let mut categorical = Vec::with_capacity(self.categorical.len());
        for column in &self.categorical {
            let values = string_values(features, column)?;
            let Some(fill_value) = most_frequent(values.iter().flatten().map(String::as_str))
            else {
                dropped.push(column.clone());
                continue;
            };

            let imputed: Vec<&str> = values
                .iter()
                .map(|value| value.as_deref().unwrap_or(fill_value.as_str()))
                .collect();
            let categories: Vec<String> = imputed
                .iter()
                .copied()
                .collect::<BTreeSet<&str>>()
                .into_iter()
                .map(str::to_string)
                .collect();
            let scalers = categories
                .iter()
                .map(|category| {
                    let indicator: Vec<f64> = imputed
                        .iter()
                        .map(|value| if *value == category.as_str() { 1.0 } else { 0.0 })
                        .collect();
                    self.cat_pipeline.scaler.fit(&indicator)
                })
                .collect();

            categorical.push(FittedCategoricalColumn {
                column: column.clone(),
                fill_value,
                categories,
                scalers,
            });
        }

        if !dropped.is_empty() {
            log_event(
                file!(),
                "Preprocessor",
                "fit",
                "preprocess.fit",
                line!(),
                &format!(
                    "Dropping columns without defined training values: [{}]",
                    dropped.join(", ")
                ),
                None,
                None,
            );
        }

        let fitted = FittedPreprocessor {
            numerical,
            categorical,
            handle_unknown: self.cat_pipeline.encoder.handle_unknown,
            dropped,
        };

        log_event(
            file!(),
            "Preprocessor",
            "fit",
            "preprocess.fit",
            line!(),
            &format!(
                "Fitted {} numerical and {} categorical columns on {} rows ({} output features)",
                fitted.numerical.len(),
                fitted.categorical.len(),
                features.height(),
                fitted.n_features()
            ),
            None,
            None,
        );

        Ok(fitted)
    }

    pub fn fit_transform(
        &self,
        features: &DataFrame,
    ) -> PreprocessResult<(FittedPreprocessor, DataFrame)> {
        let fitted = self.fit(features)?;
        let transformed = fitted.transform(features)?;
        Ok((fitted, transformed))
    }
}

impl FittedPreprocessor {
    pub fn n_features(&self) -> usize {
        self.numerical.len()
            + self
                .categorical
                .iter()
                .map(|column| column.categories.len())
                .sum::<usize>()
    }

    pub fn feature_names(&self) -> Vec<String> {
        let numeric = self
            .numerical
            .iter()
            .map(|column| format!("{NUMERIC_PREFIX}__{}", column.column));
        let categorical = self.categorical.iter().flat_map(|column| {
            column
                .categories
                .iter()
                .map(move |category| format!("{CATEGORICAL_PREFIX}__{}_{category}", column.column))
        });
        numeric.chain(categorical).collect()
    }

    /// Apply the learned statistics to `features`. Columns not routed by the transformer are
    /// dropped.
    pub fn transform(&self, features: &DataFrame) -> PreprocessResult<DataFrame> {
        let mut output = Vec::with_capacity(self.n_features());

        for fitted in &self.numerical {
            let values: Vec<f64> = float_values(features, &fitted.column)?
                .into_iter()
                .map(|value| fitted.scaler.apply(value.unwrap_or(fitted.fill_value)))
                .collect();
            output.push(Series::new(
                &format!("{NUMERIC_PREFIX}__{}", fitted.column),
                values,
            ));
        }

        for fitted in &self.categorical {
            let values = string_values(features, &fitted.column)?;
            let imputed: Vec<&str> = values
                .iter()
                .map(|value| value.as_deref().unwrap_or(fitted.fill_value.as_str()))
                .collect();

            if self.handle_unknown == UnknownCategory::Error
                && let Some(unknown) = imputed.iter().find(|value| {
                    fitted
                        .categories
                        .binary_search_by(|category| category.as_str().cmp(*value))
                        .is_err()
                })
            {
                return Err(PreprocessError::UnknownCategory {
                    column: fitted.column.clone(),
                    value: unknown.to_string(),
                });
            }

            for (category, scaler) in fitted.categories.iter().zip(&fitted.scalers) {
                let encoded: Vec<f64> = imputed
                    .iter()
                    .map(|value| {
                        let hot = if *value == category.as_str() { 1.0 } else { 0.0 };
                        scaler.apply(hot)
                    })
                    .collect();
                output.push(Series::new(
                    &format!("{CATEGORICAL_PREFIX}__{}_{category}", fitted.column),
                    encoded,
                ));
            }
        }

        Ok(DataFrame::new(output)?)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::schema::ColumnRole;

    fn schema() -> TableSchema {
        let mut schema = TableSchema::default();
        schema.insert("price", ColumnRole::Numerical);
        schema.insert("sector", ColumnRole::Categorical);
        schema
    }

    fn train() -> DataFrame {
        df! {
            "price" => &[Some(1.0), Some(3.0), None, Some(5.0)],
            "sector" => &[Some("bank"), None, Some("steel"), Some("bank")],
            "ignored" => &[1, 2, 3, 4],
        }
        .unwrap()
    }

    #[test]
    fn median_and_mode_follow_imputer_conventions() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        assert_eq!(most_frequent(["b", "a", "b", "a"]), Some("a".to_string()));
        assert_eq!(most_frequent(["b", "c", "b"]), Some("b".to_string()));
    }

    #[test]
    fn empty_schema_is_rejected() {
        assert!(matches!(
            Preprocessor::from_schema(&TableSchema::default(), UnknownCategory::Ignore),
            Err(PreprocessError::NoFeatures)
        ));
    }

    #[test]
    fn fit_learns_fill_values_categories_and_scales() {
        let preprocessor = Preprocessor::from_schema(&schema(), UnknownCategory::Ignore).unwrap();
        let fitted = preprocessor.fit(&train()).unwrap();

        let price = &fitted.numerical[0];
        assert_eq!(price.fill_value, 3.0);
        // Imputed: [1, 3, 3, 5], mean 3, population variance 2.
        assert_abs_diff_eq!(price.scaler.offset, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(price.scaler.scale, 2.0f64.sqrt(), epsilon = 1e-12);

        let sector = &fitted.categorical[0];
        assert_eq!(sector.fill_value, "bank");
        assert_eq!(sector.categories, vec!["bank", "steel"]);
        assert!(sector.scalers.iter().all(|s| s.offset == 0.0));

        assert_eq!(
            fitted.feature_names(),
            vec![
                "num_pipeline__price",
                "cat_pipeline__sector_bank",
                "cat_pipeline__sector_steel"
            ]
        );
    }

    #[test]
    fn transform_standardizes_and_encodes() {
        let preprocessor = Preprocessor::from_schema(&schema(), UnknownCategory::Ignore).unwrap();
        let (fitted, transformed) = preprocessor.fit_transform(&train()).unwrap();

        assert_eq!(transformed.shape(), (4, fitted.n_features()));
        let price: Vec<f64> = transformed
            .column("num_pipeline__price")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_abs_diff_eq!(price.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(price[2], 0.0, epsilon = 1e-12);

        // Indicator for "bank" is [1, 1, 0, 1]: population std sqrt(3)/4.
        let bank = transformed.column("cat_pipeline__sector_bank").unwrap().f64().unwrap();
        assert_abs_diff_eq!(bank.get(0).unwrap(), 4.0 / 3.0f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(bank.get(2).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn unknown_categories_follow_policy() {
        let test = df! {
            "price" => &[2.0],
            "sector" => &["mining"],
        }
        .unwrap();

        let ignoring = Preprocessor::from_schema(&schema(), UnknownCategory::Ignore)
            .unwrap()
            .fit(&train())
            .unwrap();
        let encoded = ignoring.transform(&test).unwrap();
        let bank = encoded.column("cat_pipeline__sector_bank").unwrap();
        assert_eq!(bank.f64().unwrap().get(0), Some(0.0));

        let strict = Preprocessor::from_schema(&schema(), UnknownCategory::Error)
            .unwrap()
            .fit(&train())
            .unwrap();
        assert!(matches!(
            strict.transform(&test),
            Err(PreprocessError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn missing_columns_are_errors() {
        let preprocessor = Preprocessor::from_schema(&schema(), UnknownCategory::Ignore).unwrap();
        let no_sector = df! { "price" => &[1.0] }.unwrap();
        assert!(matches!(
            preprocessor.fit(&no_sector),
            Err(PreprocessError::MissingColumn(column)) if column == "sector"
        ));
    }

    #[test]
    fn columns_without_training_values_are_dropped() {
        let preprocessor = Preprocessor::from_schema(&schema(), UnknownCategory::Ignore).unwrap();
        let all_null = df! {
            "price" => &[None::<f64>, None],
            "sector" => &["a", "b"],
        }
        .unwrap();

        let (fitted, transformed) = preprocessor.fit_transform(&all_null).unwrap();
        assert_eq!(fitted.dropped, vec!["price"]);
        assert!(fitted.numerical.is_empty());
        assert_eq!(
            fitted.feature_names(),
            vec!["cat_pipeline__sector_a", "cat_pipeline__sector_b"]
        );
        assert_eq!(transformed.shape(), (2, 2));

        let later = df! {
            "price" => &[7.0],
            "sector" => &["a"],
        }
        .unwrap();
        assert_eq!(fitted.transform(&later).unwrap().shape(), (1, 2));
    }

    #[test]
    fn fitted_state_round_trips_through_json() {
        let fitted = Preprocessor::from_schema(&schema(), UnknownCategory::Ignore)
            .unwrap()
            .fit(&train())
            .unwrap();
        let json = serde_json::to_string(&fitted).unwrap();
        let restored: FittedPreprocessor = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, fitted);
    }
}
