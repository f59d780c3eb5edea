//! Jalali (Solar Hijri) calendar dates as found in the source tables, and their
//! conversion to the proleptic Gregorian calendar.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use thiserror::Error;

use crate::logging::log_event;

/// Column holding the normalized Jalali date.
pub const JALALI_COLUMN: &str = "jalali_date";
/// Column holding the equivalent Gregorian date.
pub const GREGORIAN_COLUMN: &str = "gregorian_date";

/// Offset between the arithmetic day count below and chrono's days-from-CE numbering.
const CE_OFFSET: i64 = 365;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("malformed jalali date `{0}`")]
    Malformed(String),
    #[error("jalali date `{0}` is out of range")]
    OutOfRange(String),
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("date column `{column}` is unavailable: {source}")]
    Column { column: String, source: PolarsError },
    #[error("failed to append normalized date columns: {source}")]
    Append { source: PolarsError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JalaliDate {
    year: i32,
    month: u32,
    day: u32,
}

impl JalaliDate {
    pub fn new(year: i32, month: u32, day: u32) -> Result<Self, CalendarError> {
        let render = || format!("{year:04}/{month:02}/{day:02}");
        if !(1..=12).contains(&month) || day == 0 || year < 1 {
            return Err(CalendarError::OutOfRange(render()));
        }
        if day > month_length(year, month) {
            return Err(CalendarError::OutOfRange(render()));
        }
        Ok(Self { year, month, day })
    }

    /// Parse `YYYY/MM/DD` (or `YYYY-MM-DD`), accepting Persian and Arabic-Indic digits.
    pub fn parse(input: &str) -> Result<Self, CalendarError> {
        let normalized: String = input.trim().chars().map(ascii_digit).collect();
        let mut parts = normalized.split(['/', '-']);

        let mut next = || -> Result<&str, CalendarError> {
            parts
                .next()
                .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(|| CalendarError::Malformed(input.to_string()))
        };

        let year = next()?
            .parse::<i32>()
            .map_err(|_| CalendarError::Malformed(input.to_string()))?;
        let month = next()?
            .parse::<u32>()
            .map_err(|_| CalendarError::Malformed(input.to_string()))?;
        let day = next()?
            .parse::<u32>()
            .map_err(|_| CalendarError::Malformed(input.to_string()))?;

        if parts.next().is_some() {
            return Err(CalendarError::Malformed(input.to_string()));
        }

        Self::new(year, month, day)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn is_leap_year(year: i32) -> bool {
        day_number(year + 1, 1, 1) - day_number(year, 1, 1) == 366
    }

    pub fn to_gregorian(&self) -> Result<NaiveDate, CalendarError> {
        let days = day_number(self.year, self.month, self.day) - CE_OFFSET;
        i32::try_from(days)
            .ok()
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .ok_or_else(|| CalendarError::OutOfRange(self.to_string()))
    }
}

impl fmt::Display for JalaliDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for JalaliDate {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn ascii_digit(c: char) -> char {
    match c {
        '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
        '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
        other => other,
    }
}

fn month_length(year: i32, month: u32) -> u32 {
    match month {
        1..=6 => 31,
        7..=11 => 30,
        _ if JalaliDate::is_leap_year(year) => 30,
        _ => 29,
    }
}

/// Days elapsed since 0000-01-01 of the proleptic Gregorian calendar, using the
/// 33-year arithmetic cycle of the Jalali calendar.
fn day_number(year: i32, month: u32, day: u32) -> i64 {
    let jy = i64::from(year) + 1595;
    let month = i64::from(month);
    let month_offset = if month < 7 {
        (month - 1) * 31
    } else {
        (month - 7) * 30 + 186
    };

    -355_668 + 365 * jy + (jy / 33) * 8 + ((jy % 33) + 3) / 4 + i64::from(day) + month_offset
}

/// Days since the Unix epoch, the physical representation of a polars `Date`.
fn epoch_days(date: NaiveDate) -> i32 {
    const UNIX_EPOCH_FROM_CE: i32 = 719_163;
    date.num_days_from_ce() - UNIX_EPOCH_FROM_CE
}

/// Append `jalali_date` (normalized `YYYY-MM-DD`) and `gregorian_date` (`Date`) derived from
/// the Jalali strings in `column`. Unparseable or null entries become nulls in both outputs.
pub fn with_normalized_dates(frame: &DataFrame, column: &str) -> Result<DataFrame, NormalizeError> {
    let to_column_error = |source| NormalizeError::Column {
        column: column.to_string(),
        source,
    };
    let raw = frame
        .column(column)
        .and_then(|series| series.cast(&DataType::Utf8))
        .map_err(to_column_error)?;
    let values = raw.utf8().map_err(to_column_error)?;

    let mut jalali = Vec::with_capacity(values.len());
    let mut gregorian = Vec::with_capacity(values.len());
    let mut rejected = 0usize;

    for value in values.into_iter() {
        let converted = value.map(|text| {
            JalaliDate::parse(text).and_then(|date| Ok((date, date.to_gregorian()?)))
        });
        match converted {
            Some(Ok((date, greg))) => {
                jalali.push(Some(date.to_string()));
                gregorian.push(Some(epoch_days(greg)));
            }
            Some(Err(_)) => {
                rejected += 1;
                jalali.push(None);
                gregorian.push(None);
            }
            None => {
                jalali.push(None);
                gregorian.push(None);
            }
        }
    }

    let gregorian = Series::new(GREGORIAN_COLUMN, gregorian)
        .cast(&DataType::Date)
        .map_err(|source| NormalizeError::Append { source })?;

    let mut enriched = frame.clone();
    enriched
        .with_column(Series::new(JALALI_COLUMN, jalali))
        .and_then(|frame| frame.with_column(gregorian))
        .map_err(|source| NormalizeError::Append { source })?;

    log_event(
        file!(),
        "DateNormalizer",
        "with_normalized_dates",
        "calendar.normalize",
        line!(),
        &format!(
            "Normalized {column} -> {JALALI_COLUMN}, {GREGORIAN_COLUMN} ({rejected} unparseable)"
        ),
        None,
        None,
    );

    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nowruz_maps_to_march_equinox() {
        let date = JalaliDate::parse("1402/01/01").unwrap();
        assert_eq!(
            date.to_gregorian().unwrap(),
            NaiveDate::from_ymd_opt(2023, 3, 21).unwrap()
        );

        let date = JalaliDate::parse("1403/01/01").unwrap();
        assert_eq!(
            date.to_gregorian().unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 20).unwrap()
        );
    }

    #[test]
    fn converts_second_half_of_year() {
        let date = JalaliDate::parse("1399/10/11").unwrap();
        assert_eq!(
            date.to_gregorian().unwrap(),
            NaiveDate::from_ymd_opt(2020, 12, 31).unwrap()
        );
    }

    #[test]
    fn accepts_persian_digits_and_dashes() {
        let persian = JalaliDate::parse("۱۴۰۲/۰۵/۱۰").unwrap();
        let dashed = JalaliDate::parse("1402-05-10").unwrap();
        assert_eq!(persian, dashed);
        assert_eq!(persian.to_string(), "1402-05-10");
    }

    #[test]
    fn leap_years_follow_the_33_year_cycle() {
        assert!(JalaliDate::is_leap_year(1399));
        assert!(!JalaliDate::is_leap_year(1400));
        assert!(JalaliDate::is_leap_year(1403));
        assert!(JalaliDate::new(1403, 12, 30).is_ok());
        assert!(matches!(
            JalaliDate::new(1402, 12, 30),
            Err(CalendarError::OutOfRange(_))
        ));
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "1402/01", "1402/01/01/01", "abcd/01/01", "1402/13/01"] {
            assert!(JalaliDate::parse(input).is_err(), "{input} should not parse");
        }
    }

    #[test]
    fn normalizes_frame_column() {
        let frame = df! {
            "j_date" => &[Some("1402/01/01"), None, Some("garbage")],
            "close_price" => &[1.0, 2.0, 3.0],
        }
        .unwrap();

        let enriched = with_normalized_dates(&frame, "j_date").unwrap();
        assert_eq!(enriched.width(), 4);

        let jalali: Vec<Option<&str>> = enriched
            .column(JALALI_COLUMN)
            .unwrap()
            .utf8()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(jalali, vec![Some("1402-01-01"), None, None]);

        let gregorian = enriched.column(GREGORIAN_COLUMN).unwrap();
        assert_eq!(gregorian.dtype(), &DataType::Date);
        assert_eq!(gregorian.null_count(), 2);
        let days: Vec<Option<i32>> = gregorian
            .cast(&DataType::Int32)
            .unwrap()
            .i32()
            .unwrap()
            .into_iter()
            .collect();
        let expected = NaiveDate::from_ymd_opt(2023, 3, 21).unwrap();
        assert_eq!(days[0], Some(epoch_days(expected)));
    }

    #[test]
    fn missing_column_is_an_error() {
        let frame = df! { "close_price" => &[1.0] }.unwrap();
        assert!(matches!(
            with_normalized_dates(&frame, "j_date"),
            Err(NormalizeError::Column { .. })
        ));
    }
}
