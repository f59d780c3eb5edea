use polars::prelude::*;
use thiserror::Error;

use crate::logging::log_event;

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_WIDTH: f64 = 2.0;

/// Columns appended by [`with_indicators`], in order.
pub const INDICATOR_COLUMNS: [&str; 7] = [
    "rsi",
    "macd",
    "signal",
    "hist",
    "upper_bb",
    "middle_bb",
    "lower_bb",
];

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("price column `{column}` is unavailable: {source}")]
    PriceColumn { column: String, source: PolarsError },
    #[error("price column `{column}` has a missing value at row {row}")]
    MissingPrice { column: String, row: usize },
    #[error("failed to append indicator columns: {source}")]
    Append { source: PolarsError },
}

fn prices(frame: &DataFrame, column: &str) -> Result<Vec<f64>, IndicatorError> {
    let to_column_error = |source| IndicatorError::PriceColumn {
        column: column.to_string(),
        source,
    };
    let series = frame.column(column).map_err(to_column_error)?;
    let float_series = if series.dtype() != &DataType::Float64 {
        series.cast(&DataType::Float64).map_err(to_column_error)?
    } else {
        series.clone()
    };

    let chunked = float_series.f64().map_err(to_column_error)?;
    chunked
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            value
                .filter(|price| price.is_finite())
                .ok_or_else(|| IndicatorError::MissingPrice {
                    column: column.to_string(),
                    row,
                })
        })
        .collect()
}

/// Wilder's relative strength index. The first `period` entries are undefined.
pub fn rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    assert!(period > 0, "period must be positive");
    let mut values = vec![None; prices.len()];
    if prices.len() <= period {
        return values;
    }

    let (mut avg_gain, mut avg_loss) = prices[..=period]
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0, 0.0), |(gain, loss), change| {
            (gain + change.max(0.0), loss + (-change).max(0.0))
        });
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    values[period] = Some(strength_index(avg_gain, avg_loss));

    let smoothing = (period - 1) as f64;
    for idx in period + 1..prices.len() {
        let change = prices[idx] - prices[idx - 1];
        avg_gain = (avg_gain * smoothing + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * smoothing + (-change).max(0.0)) / period as f64;
        values[idx] = Some(strength_index(avg_gain, avg_loss));
    }

    values
}

fn strength_index(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= f64::EPSILON {
        if avg_gain <= f64::EPSILON { 50.0 } else { 100.0 }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Exponential moving average over the defined entries of `values`, seeded with the simple
/// mean of the first `period` of them.
pub fn ema(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    assert!(period > 0, "period must be positive");
    let mut out = vec![None; values.len()];
    let Some(start) = values.iter().position(Option::is_some) else {
        return out;
    };
    let defined = &values[start..];
    if defined.len() < period || defined[..period].iter().any(Option::is_none) {
        return out;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current = defined[..period].iter().flatten().sum::<f64>() / period as f64;
    out[start + period - 1] = Some(current);

    for (offset, value) in defined.iter().enumerate().skip(period) {
        if let Some(value) = value {
            current = alpha * value + (1.0 - alpha) * current;
            out[start + offset] = Some(current);
        }
    }

    out
}

/// MACD line, signal line and histogram.
pub fn macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let series: Vec<Option<f64>> = prices.iter().copied().map(Some).collect();
    let fast_ema = ema(&series, fast);
    let slow_ema = ema(&series, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(fast, slow)| Some((*fast)? - (*slow)?))
        .collect();
    let signal_line = ema(&line, signal);
    let hist = line
        .iter()
        .zip(&signal_line)
        .map(|(line, signal)| Some((*line)? - (*signal)?))
        .collect();

    (line, signal_line, hist)
}

/// Bollinger bands: (upper, middle, lower) around a simple moving average, using the
/// population standard deviation of each window.
pub fn bollinger(
    prices: &[f64],
    period: usize,
    width: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    assert!(period > 0, "period must be positive");
    let mut upper = vec![None; prices.len()];
    let mut middle = vec![None; prices.len()];
    let mut lower = vec![None; prices.len()];

    for (idx, window) in prices.windows(period).enumerate() {
        let row = idx + period - 1;
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let std = variance.max(0.0).sqrt();
        upper[row] = Some(mean + width * std);
        middle[row] = Some(mean);
        lower[row] = Some(mean - width * std);
    }

    (upper, middle, lower)
}

/// Append the RSI, MACD and Bollinger band columns computed from `price_column`.
/// Row order is left untouched.
pub fn with_indicators(
    frame: &DataFrame,
    price_column: &str,
    table: &str,
) -> Result<DataFrame, IndicatorError> {
    let prices = prices(frame, price_column)?;

    let rsi = rsi(&prices, RSI_PERIOD);
    let (macd, signal, hist) = macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let (upper, middle, lower) = bollinger(&prices, BOLLINGER_PERIOD, BOLLINGER_WIDTH);

    let columns = [rsi, macd, signal, hist, upper, middle, lower];
    let mut enriched = frame.clone();
    for (name, values) in INDICATOR_COLUMNS.iter().zip(columns) {
        enriched
            .with_column(Series::new(name, values))
            .map_err(|source| IndicatorError::Append { source })?;
    }

    log_event(
        file!(),
        "IndicatorCalculator",
        "with_indicators",
        "features.indicators",
        line!(),
        &format!(
            "Computed RSI({RSI_PERIOD}), MACD({MACD_FAST},{MACD_SLOW},{MACD_SIGNAL}) and \
             Bollinger({BOLLINGER_PERIOD}) for {price_column} over {} rows",
            prices.len()
        ),
        None,
        Some(table),
    );

    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn sawtooth(len: usize) -> Vec<f64> {
        let mut prices = vec![100.0];
        for idx in 1..len {
            let change = if idx % 2 == 1 { 2.0 } else { -1.0 };
            prices.push(prices[idx - 1] + change);
        }
        prices
    }

    #[test]
    fn rsi_seeds_with_simple_averages() {
        let values = rsi(&sawtooth(40), RSI_PERIOD);
        assert!(values[..RSI_PERIOD].iter().all(Option::is_none));
        // 7 gains of 2 and 7 losses of 1: avg gain 1.0, avg loss 0.5.
        assert_abs_diff_eq!(values[RSI_PERIOD].unwrap(), 100.0 - 100.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(values[20].unwrap(), 66.07317239868348, epsilon = 1e-9);
        assert!(values.iter().flatten().all(|v| (0.0..=100.0).contains(v)));
    }

    #[test]
    fn rsi_saturates_without_losses() {
        let rising: Vec<f64> = (0..30).map(|i| 10.0 + i as f64).collect();
        assert_eq!(rsi(&rising, RSI_PERIOD)[29], Some(100.0));

        let flat = vec![5.0; 30];
        assert_eq!(rsi(&flat, RSI_PERIOD)[29], Some(50.0));
    }

    #[test]
    fn ema_on_constant_series_is_constant() {
        let constant: Vec<Option<f64>> = vec![Some(3.0); 10];
        let values = ema(&constant, 4);
        assert!(values[..3].iter().all(Option::is_none));
        assert!(values[3..].iter().all(|v| *v == Some(3.0)));
    }

    #[test]
    fn macd_lookbacks_leave_leading_nulls() {
        let prices: Vec<f64> = (0..60).map(|i| 50.0 + (i as f64 / 3.0).sin()).collect();
        let (line, signal, hist) = macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL);

        assert_eq!(line.iter().position(Option::is_some), Some(MACD_SLOW - 1));
        assert_eq!(
            signal.iter().position(Option::is_some),
            Some(MACD_SLOW + MACD_SIGNAL - 2)
        );
        for ((line, signal), hist) in line.iter().zip(&signal).zip(&hist) {
            if let (Some(line), Some(signal), Some(hist)) = (line, signal, hist) {
                assert_abs_diff_eq!(*hist, line - signal, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn bollinger_bands_are_symmetric_around_the_mean() {
        let prices: Vec<f64> = (1..=25).map(f64::from).collect();
        let (upper, middle, lower) = bollinger(&prices, BOLLINGER_PERIOD, BOLLINGER_WIDTH);

        assert!(middle[..BOLLINGER_PERIOD - 1].iter().all(Option::is_none));
        assert_abs_diff_eq!(middle[19].unwrap(), 10.5, epsilon = 1e-12);
        // Population std of 1..=20.
        let std = (399.0f64 / 12.0).sqrt();
        assert_abs_diff_eq!(upper[19].unwrap(), 10.5 + 2.0 * std, epsilon = 1e-12);
        assert_abs_diff_eq!(lower[19].unwrap(), 10.5 - 2.0 * std, epsilon = 1e-12);
    }

    #[test]
    fn appends_one_value_per_row() {
        let prices = sawtooth(35);
        let frame = df! { "close_price" => &prices }.unwrap();
        let enriched = with_indicators(&frame, "close_price", "test").unwrap();

        assert_eq!(enriched.width(), 1 + INDICATOR_COLUMNS.len());
        for name in INDICATOR_COLUMNS {
            assert_eq!(enriched.column(name).unwrap().len(), 35);
        }
        assert_eq!(enriched.column("rsi").unwrap().null_count(), RSI_PERIOD);
        assert_eq!(enriched.column("macd").unwrap().null_count(), MACD_SLOW - 1);
        assert_eq!(
            enriched.column("close_price").unwrap().f64().unwrap().get(3),
            Some(prices[3])
        );
    }

    #[test]
    fn missing_price_is_rejected() {
        let frame = df! { "close_price" => &[Some(1.0), None, Some(3.0)] }.unwrap();
        assert!(matches!(
            with_indicators(&frame, "close_price", "test"),
            Err(IndicatorError::MissingPrice { row: 1, .. })
        ));
        assert!(matches!(
            with_indicators(&frame, "open_price", "test"),
            Err(IndicatorError::PriceColumn { .. })
        ));
    }
}
