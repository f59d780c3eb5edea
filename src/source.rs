//! Table discovery and full-table reads from the relational source.

use std::path::Path;

use polars::prelude::*;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use thiserror::Error;

use crate::calendar::{NormalizeError, with_normalized_dates};
use crate::logging::log_event;
use crate::schema::coerce_identifiers;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open database `{url}`: {source}")]
    Connect { url: String, source: rusqlite::Error },
    #[error("query failed: {source}")]
    Query {
        #[from]
        source: rusqlite::Error,
    },
    #[error("column `{column}` of table `{table}` holds binary data")]
    Blob { table: String, column: String },
    #[error("failed to build frame for table `{table}`: {source}")]
    Frame { table: String, source: PolarsError },
    #[error(transparent)]
    Dates(#[from] NormalizeError),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Anything the orchestrator can enumerate and read tables from.
pub trait TableSource {
    /// Names of the tables to process, in processing order.
    fn list_tables(&mut self) -> SourceResult<Vec<String>>;

    /// Full contents of `table`, with identifier columns as strings and dates normalized.
    fn load_table(&mut self, table: &str) -> SourceResult<DataFrame>;
}

/// Naming rules applied to every loaded table.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub excluded_table_patterns: Vec<String>,
    pub identifier_markers: Vec<String>,
    pub date_column: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            excluded_table_patterns: vec!["energy".to_string(), "property".to_string()],
            identifier_markers: vec!["id".to_string(), "meta".to_string()],
            date_column: "j_date".to_string(),
        }
    }
}

pub struct SqliteSource {
    conn: Connection,
    options: SourceOptions,
}

impl SqliteSource {
    /// Open the database named by `url`: `sqlite://path`, `sqlite:path`, a plain path or
    /// `:memory:`.
    pub fn open(url: &str, options: SourceOptions) -> SourceResult<Self> {
        let location = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        let conn = if location == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(Path::new(location))
        }
        .map_err(|source| SourceError::Connect {
            url: url.to_string(),
            source,
        })?;

        log_event(
            file!(),
            "SqliteSource",
            "open",
            "source.connect",
            line!(),
            &format!("Opened database {location}"),
            None,
            None,
        );

        Ok(Self { conn, options })
    }

    pub fn from_connection(conn: Connection, options: SourceOptions) -> Self {
        Self { conn, options }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn is_excluded(&self, table: &str) -> bool {
        self.options
            .excluded_table_patterns
            .iter()
            .any(|pattern| table.contains(pattern.as_str()))
    }

    fn read_frame(&self, table: &str) -> SourceResult<DataFrame> {
        let sql = format!("SELECT * FROM \"{}\"", table.replace('"', "\"\""));
        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut cells: Vec<Vec<Cell>> = vec![Vec::new(); names.len()];
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (idx, column) in cells.iter_mut().enumerate() {
                let cell = match row.get_ref(idx)? {
                    ValueRef::Null => Cell::Null,
                    ValueRef::Integer(value) => Cell::Integer(value),
                    ValueRef::Real(value) => Cell::Real(value),
                    ValueRef::Text(bytes) => {
                        Cell::Text(String::from_utf8_lossy(bytes).into_owned())
                    }
                    ValueRef::Blob(_) => {
                        return Err(SourceError::Blob {
                            table: table.to_string(),
                            column: names[idx].clone(),
                        });
                    }
                };
                column.push(cell);
            }
        }

        let columns: Vec<Series> = names
            .iter()
            .zip(cells)
            .map(|(name, values)| column_series(name, values))
            .collect();

        DataFrame::new(columns).map_err(|source| SourceError::Frame {
            table: table.to_string(),
            source,
        })
    }
}

impl TableSource for SqliteSource {
    fn list_tables(&mut self) -> SourceResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            if self.is_excluded(&name) {
                log_event(
                    file!(),
                    "SqliteSource",
                    "list_tables",
                    "source.discover",
                    line!(),
                    &format!("Skipped excluded table {name}"),
                    None,
                    Some(&name),
                );
                continue;
            }
            log_event(
                file!(),
                "SqliteSource",
                "list_tables",
                "source.discover",
                line!(),
                &format!("Added table {name} to tables list"),
                None,
                Some(&name),
            );
            tables.push(name);
        }

        Ok(tables)
    }

    fn load_table(&mut self, table: &str) -> SourceResult<DataFrame> {
        let frame = self.read_frame(table)?;
        let mut frame =
            coerce_identifiers(&frame, &self.options.identifier_markers).map_err(|source| {
                SourceError::Frame {
                    table: table.to_string(),
                    source,
                }
            })?;

        let date_column = self.options.date_column.as_str();
        if frame.get_column_names().contains(&date_column) {
            frame = with_normalized_dates(&frame, date_column)?;
        }

        log_event(
            file!(),
            "SqliteSource",
            "load_table",
            "source.load",
            line!(),
            &format!(
                "Loaded {} rows x {} columns from {table}",
                frame.height(),
                frame.width()
            ),
            None,
            Some(table),
        );

        Ok(frame)
    }
}

#[derive(Debug, Clone)]
enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Pick the narrowest dtype that holds every value: integers, then floats, then strings.
fn column_series(name: &str, values: Vec<Cell>) -> Series {
    let has_text = values.iter().any(|cell| matches!(cell, Cell::Text(_)));
    let has_real = values.iter().any(|cell| matches!(cell, Cell::Real(_)));
    let has_integer = values.iter().any(|cell| matches!(cell, Cell::Integer(_)));

    if has_text || !(has_real || has_integer) {
        let strings: Vec<Option<String>> = values
            .into_iter()
            .map(|cell| match cell {
                Cell::Null => None,
                Cell::Integer(value) => Some(value.to_string()),
                Cell::Real(value) => Some(value.to_string()),
                Cell::Text(value) => Some(value),
            })
            .collect();
        Series::new(name, strings)
    } else if has_real {
        let floats: Vec<Option<f64>> = values
            .into_iter()
            .map(|cell| match cell {
                Cell::Integer(value) => Some(value as f64),
                Cell::Real(value) => Some(value),
                _ => None,
            })
            .collect();
        Series::new(name, floats)
    } else {
        let integers: Vec<Option<i64>> = values
            .into_iter()
            .map(|cell| match cell {
                Cell::Integer(value) => Some(value),
                _ => None,
            })
            .collect();
        Series::new(name, integers)
    }
}
