use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::schema::{ColumnMeta, ColumnType};

/// A decoded row: one slot per schema column, `None` for null.
pub type Row = Vec<Option<Value>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_date_with_format(value: &str, format: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), format)
        .with_context(|| format!("Failed to parse '{value}' as date using '{format}'"))
}

pub fn parse_integer(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    if let Ok(parsed) = trimmed.parse::<i64>() {
        return Ok(parsed);
    }
    // `1.0` style exports of whole numbers still count as integers.
    let float = parse_float(trimmed)
        .with_context(|| format!("Failed to parse '{value}' as integer"))?;
    if float.fract() == 0.0 && float >= i64::MIN as f64 && float < i64::MAX as f64 {
        Ok(float as i64)
    } else {
        bail!("Failed to parse '{value}' as integer")
    }
}

pub fn parse_float(value: &str) -> Result<f64> {
    let parsed: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse '{value}' as float"))?;
    if !parsed.is_finite() {
        bail!("Refusing non-finite float '{value}'");
    }
    Ok(parsed)
}

/// Coerces non-empty text to the column's declared type.
pub fn parse_typed_value(value: &str, column: &ColumnMeta) -> Result<Value> {
    let parsed = match column.datatype {
        ColumnType::String => Value::Text(value.to_string()),
        ColumnType::Integer => Value::Integer(parse_integer(value)?),
        ColumnType::Float => Value::Float(parse_float(value)?),
        ColumnType::Date => {
            let date = match column.date_format.as_deref() {
                Some(format) => parse_date_with_format(value, format)?,
                None => parse_naive_date(value.trim())?,
            };
            Value::Date(date)
        }
    };
    Ok(parsed)
}
