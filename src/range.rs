//! Inclusive calendar-date row filter.
//!
//! A row is kept only when its date column holds a value that parses with the
//! configured format and falls inside the bounds. Nulls and unparseable text
//! exclude the row; they never fail the run.

use chrono::{
    NaiveDate,
    format::{Item, StrftimeItems},
};
use log::debug;

use crate::{
    data::{Row, Value, parse_date_with_format},
    error::PipelineError,
    schema::Schema,
};

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    column: String,
    index: usize,
    format: String,
    lower: Option<NaiveDate>,
    upper: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(
        schema: &Schema,
        column: &str,
        format: &str,
        lower: Option<NaiveDate>,
        upper: Option<NaiveDate>,
    ) -> Result<Self, PipelineError> {
        let index = schema.column_index(column).ok_or_else(|| {
            PipelineError::Config(format!(
                "date column '{column}' is not present in the source header"
            ))
        })?;
        if format.trim().is_empty()
            || StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
        {
            return Err(PipelineError::Config(format!(
                "date format '{format}' is not a valid strftime pattern"
            )));
        }
        if let (Some(lower), Some(upper)) = (lower, upper)
            && lower > upper
        {
            return Err(PipelineError::Config(format!(
                "date range start {lower} is after its end {upper}"
            )));
        }
        debug!("Date filter on '{column}' (index {index}) using '{format}'");
        Ok(Self {
            column: column.to_string(),
            index,
            format: format.to_string(),
            lower,
            upper,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.lower.is_none_or(|lower| date >= lower)
            && self.upper.is_none_or(|upper| date <= upper)
    }

    /// Evaluated against the decoded row before projection, so the date
    /// column does not have to be among the kept columns.
    pub fn include(&self, row: &Row) -> bool {
        let date = match row.get(self.index) {
            Some(Some(Value::Date(date))) => *date,
            Some(Some(other)) => match parse_date_with_format(&other.as_display(), &self.format) {
                Ok(date) => date,
                Err(_) => return false,
            },
            _ => return false,
        };
        self.contains(date)
    }
}
