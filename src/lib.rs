//! featforge turns relational price tables into model-ready feature sets.
//! It persists raw/train/test splits, derives RSI, MACD and Bollinger band indicators,
//! labels rows as BUY/SELL/HOLD, and fits imputation, encoding and scaling pipelines
//! whose learned state is saved for transform-only reuse.

pub mod artifacts;
pub mod calendar;
pub mod config;
pub mod error;
pub mod indicators;
pub mod labels;
pub mod logging;
pub mod pipeline;
pub mod preprocess;
pub mod schema;
pub mod source;
pub mod split;

pub use artifacts::{ArtifactError, ArtifactStore, TableArtifacts};
pub use calendar::{JalaliDate, with_normalized_dates};
pub use config::{ConfigError, PipelineConfig};
pub use error::{PipelineError, Step};
pub use indicators::{INDICATOR_COLUMNS, IndicatorError, with_indicators};
pub use labels::{LabelThresholds, TradeAction, with_labels, with_labels_using};
pub use pipeline::{RunContext, TableOutcome, process_table, run, transform_new_rows};
pub use preprocess::{FittedPreprocessor, PreprocessError, Preprocessor, UnknownCategory};
pub use schema::{ColumnRole, TableSchema};
pub use source::{SourceError, SourceOptions, SqliteSource, TableSource};
pub use split::{SplitError, train_test_split};

pub type Result<T> = anyhow::Result<T>;
