use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::logging::log_event;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("test size must lie strictly between 0 and 1, got {0}")]
    InvalidTestSize(f64),
    #[error("cannot split {rows} rows into non-empty train and test sets")]
    TooFewRows { rows: usize },
    #[error("failed to gather split rows: {0}")]
    Polars(#[from] PolarsError),
}

/// Row positions of a train/test partition, each in ascending source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partition `rows` positions: the test set takes `ceil(test_size * rows)` positions of a
/// permutation drawn from `seed`, the train set keeps the rest.
pub fn split_indices(rows: usize, test_size: f64, seed: u64) -> Result<SplitIndices, SplitError> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(SplitError::InvalidTestSize(test_size));
    }

    let n_test = (test_size * rows as f64).ceil() as usize;
    if n_test == 0 || n_test >= rows {
        return Err(SplitError::TooFewRows { rows });
    }

    let mut permutation: Vec<usize> = (0..rows).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    permutation.shuffle(&mut rng);

    let mut test = permutation[..n_test].to_vec();
    let mut train = permutation[n_test..].to_vec();
    // Indicators need time-ascending rows within each split.
    test.sort_unstable();
    train.sort_unstable();

    Ok(SplitIndices { train, test })
}

fn gather(frame: &DataFrame, rows: &[usize]) -> PolarsResult<DataFrame> {
    let indices = IdxCa::from_vec("idx", rows.iter().map(|&row| row as IdxSize).collect());
    frame.take(&indices)
}

/// Split `frame` into (train, test) with a reproducible seeded shuffle.
pub fn train_test_split(
    frame: &DataFrame,
    test_size: f64,
    seed: u64,
    table: &str,
) -> Result<(DataFrame, DataFrame), SplitError> {
    let indices = split_indices(frame.height(), test_size, seed)?;
    let train = gather(frame, &indices.train)?;
    let test = gather(frame, &indices.test)?;

    log_event(
        file!(),
        "TrainTestSplit",
        "train_test_split",
        "pipeline.split",
        line!(),
        &format!(
            "Split {} rows into {} train and {} test rows (seed {seed})",
            frame.height(),
            train.height(),
            test.height()
        ),
        None,
        Some(table),
    );

    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn split_is_reproducible_and_disjoint() {
        let first = split_indices(100, 0.2, 102).unwrap();
        let second = split_indices(100, 0.2, 102).unwrap();
        assert_eq!(first, second);

        assert_eq!(first.test.len(), 20);
        assert_eq!(first.train.len(), 80);

        let all: BTreeSet<usize> = first.train.iter().chain(&first.test).copied().collect();
        assert_eq!(all.len(), 100);
        assert!(first.train.windows(2).all(|w| w[0] < w[1]));
        assert!(first.test.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn seed_changes_membership() {
        let a = split_indices(100, 0.2, 102).unwrap();
        let b = split_indices(100, 0.2, 7).unwrap();
        assert_ne!(a.test, b.test);
    }

    #[test]
    fn test_share_rounds_up() {
        let indices = split_indices(11, 0.2, 102).unwrap();
        assert_eq!(indices.test.len(), 3);
        assert_eq!(indices.train.len(), 8);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(matches!(
            split_indices(1, 0.2, 102),
            Err(SplitError::TooFewRows { rows: 1 })
        ));
        assert!(matches!(
            split_indices(10, 1.0, 102),
            Err(SplitError::InvalidTestSize(_))
        ));
    }

    #[test]
    fn gathers_rows_in_source_order() {
        let frame = df! { "row" => (0..10i64).collect::<Vec<_>>() }.unwrap();
        let (train, test) = train_test_split(&frame, 0.2, 102, "test").unwrap();
        assert_eq!(train.height() + test.height(), 10);

        let rows: Vec<i64> = train
            .column("row")
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!(rows.windows(2).all(|w| w[0] < w[1]));
    }
}
