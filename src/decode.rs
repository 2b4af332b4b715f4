//! Row decoding: raw delimited records into typed [`Row`]s.
//!
//! The decoder owns the per-run anomaly policy. In [`DecodeMode::Tolerant`]
//! ragged rows are padded or truncated to the schema width and values that do
//! not coerce to their declared type are kept as text. In
//! [`DecodeMode::Strict`] either condition drops the row and counts it.
//! Invalid byte sequences are replaced with U+FFFD in both modes.

use std::collections::BTreeSet;

use csv::ByteRecord;
use encoding_rs::Encoding;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Row, Value, parse_typed_value},
    io_utils,
    schema::{ColumnType, Schema},
};

const DEFAULT_NULL_TOKENS: &[&str] = &["NA", "N/A", "null", "", " "];

/// Literal tokens decoded as null in every column. The empty string is
/// always null regardless of the configured tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullPolicy {
    tokens: BTreeSet<String>,
}

impl Default for NullPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_NULL_TOKENS.iter().copied())
    }
}

impl NullPolicy {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(&self, value: &str) -> bool {
        value.is_empty() || self.tokens.contains(value)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    #[default]
    Tolerant,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    FieldCount { expected: usize, found: usize },
    Coercion { column: String, value: String },
    Encoding { column: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Row(Row),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub records: usize,
    pub rows_skipped: usize,
    pub ragged_rows: usize,
    pub coercion_fallbacks: usize,
    pub replaced_fields: usize,
}

pub struct RowDecoder<'a> {
    schema: &'a Schema,
    encoding: &'static Encoding,
    null_policy: &'a NullPolicy,
    mode: DecodeMode,
    stats: DecodeStats,
}

impl<'a> RowDecoder<'a> {
    pub fn new(
        schema: &'a Schema,
        encoding: &'static Encoding,
        null_policy: &'a NullPolicy,
        mode: DecodeMode,
    ) -> Self {
        Self {
            schema,
            encoding,
            null_policy,
            mode,
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn decode(&mut self, record: &ByteRecord) -> Decoded {
        self.stats.records += 1;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let width = self.schema.columns.len();

        if record.len() != width {
            if self.mode == DecodeMode::Strict {
                debug!(
                    "Line {line}: skipping row with {} field(s), expected {width}",
                    record.len()
                );
                return self.skip(SkipReason::FieldCount {
                    expected: width,
                    found: record.len(),
                });
            }
            self.stats.ragged_rows += 1;
        }

        let mut row = Vec::with_capacity(width);
        for (idx, column) in self.schema.columns.iter().enumerate() {
            let Some(bytes) = record.get(idx) else {
                row.push(None);
                continue;
            };
            let (text, had_errors) = io_utils::decode_bytes_lossy(bytes, self.encoding);
            if had_errors {
                if self.mode == DecodeMode::Strict {
                    debug!("Line {line}: skipping row with undecodable '{}'", column.name);
                    return self.skip(SkipReason::Encoding {
                        column: column.name.clone(),
                    });
                }
                self.stats.replaced_fields += 1;
            }
            if self.null_policy.is_null(&text) {
                row.push(None);
                continue;
            }
            match parse_typed_value(&text, column) {
                Ok(value) => row.push(Some(value)),
                Err(err) => match self.mode {
                    DecodeMode::Strict => {
                        debug!("Line {line}: skipping row ({err})");
                        return self.skip(SkipReason::Coercion {
                            column: column.name.clone(),
                            value: text,
                        });
                    }
                    DecodeMode::Tolerant => {
                        debug_assert!(column.datatype != ColumnType::String);
                        self.stats.coercion_fallbacks += 1;
                        row.push(Some(Value::Text(text)));
                    }
                },
            }
        }
        Decoded::Row(row)
    }

    fn skip(&mut self, reason: SkipReason) -> Decoded {
        self.stats.rows_skipped += 1;
        Decoded::Skip(reason)
    }
}
