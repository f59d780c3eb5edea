use std::collections::BTreeMap;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a column participates in preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// Keys and metadata; stored as strings and encoded like categories.
    Identifier,
    Categorical,
    Numerical,
}

impl ColumnRole {
    /// Whether the column is routed through the categorical sub-pipeline.
    pub fn is_categorical(&self) -> bool {
        !matches!(self, ColumnRole::Numerical)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("declared column `{0}` is not present in the table")]
    UnknownColumn(String),
    #[error("column `{0}` is declared numerical but has a non-numeric dtype")]
    NotNumeric(String),
}

/// Column name to role mapping for one table, in frame column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<(String, ColumnRole)>,
}

impl TableSchema {
    /// Classify columns by naming convention (`markers` substrings mark identifiers), then by
    /// dtype.
    pub fn infer(frame: &DataFrame, markers: &[String]) -> Self {
        let columns = frame
            .get_columns()
            .iter()
            .map(|series| {
                let name = series.name();
                let role = if is_identifier(name, markers) {
                    ColumnRole::Identifier
                } else if series.dtype().is_numeric() {
                    ColumnRole::Numerical
                } else {
                    ColumnRole::Categorical
                };
                (name.to_string(), role)
            })
            .collect();

        Self { columns }
    }

    /// Infer roles, then apply the explicitly declared ones on top. Declaring a column that
    /// does not exist, or declaring a string column numerical, is rejected.
    pub fn with_declared(
        frame: &DataFrame,
        markers: &[String],
        declared: &BTreeMap<String, ColumnRole>,
    ) -> Result<Self, SchemaError> {
        let mut schema = Self::infer(frame, markers);

        for (name, role) in declared {
            let series = frame
                .column(name)
                .map_err(|_| SchemaError::UnknownColumn(name.clone()))?;
            if *role == ColumnRole::Numerical && !series.dtype().is_numeric() {
                return Err(SchemaError::NotNumeric(name.clone()));
            }
            if let Some(entry) = schema.columns.iter_mut().find(|(column, _)| column == name) {
                entry.1 = *role;
            }
        }

        Ok(schema)
    }

    pub fn role(&self, column: &str) -> Option<ColumnRole> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, role)| *role)
    }

    pub fn insert(&mut self, column: impl Into<String>, role: ColumnRole) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(entry) => entry.1 = role,
            None => self.columns.push((column, role)),
        }
    }

    pub fn remove(&mut self, column: &str) {
        self.columns.retain(|(name, _)| name != column);
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnRole)> {
        self.columns.iter().map(|(name, role)| (name.as_str(), *role))
    }

    pub fn numerical(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|(_, role)| !role.is_categorical())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn categorical(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|(_, role)| role.is_categorical())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

pub fn is_identifier(column: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| column.contains(marker.as_str()))
}

/// Cast identifier columns to strings so they are never treated as quantities.
pub fn coerce_identifiers(frame: &DataFrame, markers: &[String]) -> PolarsResult<DataFrame> {
    let mut coerced = frame.clone();
    for name in frame.get_column_names() {
        if is_identifier(name, markers) {
            let series = frame.column(name)?.cast(&DataType::Utf8)?;
            coerced.with_column(series)?;
        }
    }
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["id".to_string(), "meta".to_string()]
    }

    fn frame() -> DataFrame {
        df! {
            "symbol_id" => &[1i64, 2, 3],
            "metadata" => &["a", "b", "c"],
            "sector" => &["x", "y", "x"],
            "close_price" => &[1.0, 2.0, 3.0],
            "volume" => &[10i64, 20, 30],
        }
        .unwrap()
    }

    #[test]
    fn infers_roles_from_names_and_dtypes() {
        let schema = TableSchema::infer(&frame(), &markers());
        assert_eq!(schema.role("symbol_id"), Some(ColumnRole::Identifier));
        assert_eq!(schema.role("metadata"), Some(ColumnRole::Identifier));
        assert_eq!(schema.role("sector"), Some(ColumnRole::Categorical));
        assert_eq!(schema.role("close_price"), Some(ColumnRole::Numerical));
        assert_eq!(schema.numerical(), vec!["close_price", "volume"]);
        assert_eq!(schema.categorical(), vec!["symbol_id", "metadata", "sector"]);
    }

    #[test]
    fn declared_roles_override_inference() {
        let declared = BTreeMap::from([("volume".to_string(), ColumnRole::Categorical)]);
        let schema = TableSchema::with_declared(&frame(), &markers(), &declared).unwrap();
        assert_eq!(schema.role("volume"), Some(ColumnRole::Categorical));

        let unknown = BTreeMap::from([("missing".to_string(), ColumnRole::Numerical)]);
        assert_eq!(
            TableSchema::with_declared(&frame(), &markers(), &unknown),
            Err(SchemaError::UnknownColumn("missing".to_string()))
        );

        let bad = BTreeMap::from([("sector".to_string(), ColumnRole::Numerical)]);
        assert_eq!(
            TableSchema::with_declared(&frame(), &markers(), &bad),
            Err(SchemaError::NotNumeric("sector".to_string()))
        );
    }

    #[test]
    fn identifiers_become_strings() {
        let coerced = coerce_identifiers(&frame(), &markers()).unwrap();
        assert_eq!(coerced.column("symbol_id").unwrap().dtype(), &DataType::Utf8);
        assert_eq!(coerced.column("metadata").unwrap().dtype(), &DataType::Utf8);
        assert_eq!(coerced.column("volume").unwrap().dtype(), &DataType::Int64);
    }
}
