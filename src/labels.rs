use std::fmt;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::log_event;

pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const RSI_OVERSOLD: f64 = 30.0;
pub const UPPER_QUANTILE: f64 = 0.9;
pub const LOWER_QUANTILE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("indicator column `{column}` is unavailable: {source}")]
    Indicator { column: String, source: PolarsError },
    #[error("failed to append label column `{column}`: {source}")]
    Append { column: String, source: PolarsError },
}

/// Quantile thresholds of the Bollinger bands that gate BUY and SELL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelThresholds {
    pub upper_p90: Option<f64>,
    pub upper_p10: Option<f64>,
    pub lower_p90: Option<f64>,
    pub lower_p10: Option<f64>,
}

impl LabelThresholds {
    /// Quantiles over the non-null band values of `frame`.
    pub fn from_frame(frame: &DataFrame) -> Result<Self, LabelError> {
        let upper = defined_values(frame, "upper_bb")?;
        let lower = defined_values(frame, "lower_bb")?;

        Ok(Self {
            upper_p90: quantile(&upper, UPPER_QUANTILE),
            upper_p10: quantile(&upper, LOWER_QUANTILE),
            lower_p90: quantile(&lower, UPPER_QUANTILE),
            lower_p10: quantile(&lower, LOWER_QUANTILE),
        })
    }
}

/// Indicator values of one row. Missing values make every comparison false.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndicatorRow {
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub upper_bb: Option<f64>,
    pub lower_bb: Option<f64>,
}

fn greater(value: Option<f64>, bound: Option<f64>) -> bool {
    matches!((value, bound), (Some(value), Some(bound)) if value > bound)
}

fn less(value: Option<f64>, bound: Option<f64>) -> bool {
    matches!((value, bound), (Some(value), Some(bound)) if value < bound)
}

pub fn classify(row: &IndicatorRow, thresholds: &LabelThresholds) -> TradeAction {
    let sell = greater(row.rsi, Some(RSI_OVERBOUGHT))
        && less(row.macd, Some(0.0))
        && greater(row.upper_bb, thresholds.upper_p90)
        && less(row.lower_bb, thresholds.lower_p90);
    if sell {
        return TradeAction::Sell;
    }

    let buy = less(row.rsi, Some(RSI_OVERSOLD))
        && greater(row.macd, Some(0.0))
        && less(row.upper_bb, thresholds.upper_p10)
        && greater(row.lower_bb, thresholds.lower_p10);
    if buy {
        return TradeAction::Buy;
    }

    TradeAction::Hold
}

/// Linearly interpolated quantile, `q` in [0, 1]. `None` for an empty sample.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let fraction = position - below as f64;
    Some(sorted[below] + (sorted[above] - sorted[below]) * fraction)
}

fn column_values(frame: &DataFrame, column: &str) -> Result<Vec<Option<f64>>, LabelError> {
    let to_error = |source| LabelError::Indicator {
        column: column.to_string(),
        source,
    };
    let series = frame
        .column(column)
        .and_then(|series| series.cast(&DataType::Float64))
        .map_err(to_error)?;
    let values = series.f64().map_err(to_error)?;
    Ok(values.into_iter().map(|value| value.filter(|v| v.is_finite())).collect())
}

fn defined_values(frame: &DataFrame, column: &str) -> Result<Vec<f64>, LabelError> {
    Ok(column_values(frame, column)?.into_iter().flatten().collect())
}

/// Append the trade action column using thresholds computed over `frame` itself.
pub fn with_labels(
    frame: &DataFrame,
    label_column: &str,
    table: &str,
) -> Result<DataFrame, LabelError> {
    let thresholds = LabelThresholds::from_frame(frame)?;
    with_labels_using(frame, &thresholds, label_column, table)
}

/// Append the trade action column using externally supplied thresholds.
pub fn with_labels_using(
    frame: &DataFrame,
    thresholds: &LabelThresholds,
    label_column: &str,
    table: &str,
) -> Result<DataFrame, LabelError> {
    let rsi = column_values(frame, "rsi")?;
    let macd = column_values(frame, "macd")?;
    let upper = column_values(frame, "upper_bb")?;
    let lower = column_values(frame, "lower_bb")?;

    let actions: Vec<TradeAction> = (0..frame.height())
        .map(|idx| {
            let row = IndicatorRow {
                rsi: rsi[idx],
                macd: macd[idx],
                upper_bb: upper[idx],
                lower_bb: lower[idx],
            };
            classify(&row, thresholds)
        })
        .collect();

    let count = |action: TradeAction| actions.iter().filter(|a| **a == action).count();
    let summary = format!(
        "Labelled {} rows: {} BUY, {} SELL, {} HOLD",
        actions.len(),
        count(TradeAction::Buy),
        count(TradeAction::Sell),
        count(TradeAction::Hold)
    );

    let labels: Vec<&str> = actions.iter().map(TradeAction::as_str).collect();
    let mut labelled = frame.clone();
    labelled
        .with_column(Series::new(label_column, labels))
        .map_err(|source| LabelError::Append {
            column: label_column.to_string(),
            source,
        })?;

    log_event(
        file!(),
        "LabelDeriver",
        "with_labels_using",
        "features.labels",
        line!(),
        &summary,
        None,
        Some(table),
    );

    Ok(labelled)
}
