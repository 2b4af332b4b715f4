//! Exact duplicate suppression with first-occurrence-wins semantics.
//!
//! Keys compare structurally over the retained columns: null equals null,
//! numbers compare by value (so `1` and `1.0` collide), text compares by exact
//! characters and dates by calendar day.

use std::collections::HashSet;

use chrono::Datelike;

use crate::data::{Row, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyValue {
    Null,
    Integer(i64),
    Float(u64),
    Text(Box<str>),
    Date(i32),
}

impl KeyValue {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None => KeyValue::Null,
            Some(Value::Integer(i)) => KeyValue::Integer(*i),
            Some(Value::Float(f)) => canonical_float(*f),
            Some(Value::Text(s)) => KeyValue::Text(s.as_str().into()),
            Some(Value::Date(d)) => KeyValue::Date(d.num_days_from_ce()),
        }
    }
}

fn canonical_float(value: f64) -> KeyValue {
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        KeyValue::Integer(value as i64)
    } else {
        KeyValue::Float(value.to_bits())
    }
}

/// The equality witness of a row after projection and filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(Box<[KeyValue]>);

impl DedupKey {
    pub fn from_row(row: &Row) -> Self {
        DedupKey(row.iter().map(|v| KeyValue::from_value(v.as_ref())).collect())
    }
}

/// Tracks the distinct keys seen during one run. Memory grows with the
/// number of distinct rows, never with the number of duplicates.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<DedupKey>,
    duplicates: usize,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is offered and `false` afterwards.
    pub fn admit(&mut self, key: DedupKey) -> bool {
        let fresh = self.seen.insert(key);
        if !fresh {
            self.duplicates += 1;
        }
        fresh
    }

    pub fn admit_row(&mut self, row: &Row) -> bool {
        self.admit(DedupKey::from_row(row))
    }

    pub fn distinct(&self) -> usize {
        self.seen.len()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}
