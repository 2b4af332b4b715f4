//! Column projection.
//!
//! Kept columns always appear in schema order; the order in which the caller
//! listed them is ignored so that output layout does not depend on how the
//! selection was made.

use std::collections::HashSet;

use log::debug;

use crate::{
    data::Row,
    error::PipelineError,
    schema::{ColumnMeta, Schema},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    indices: Vec<usize>,
    identity: bool,
}

impl Projection {
    /// Validates `keep` against `schema`. An empty `keep` is an error; pass
    /// [`Projection::all`] to retain every column.
    pub fn new(schema: &Schema, keep: &[String]) -> Result<Self, PipelineError> {
        if keep.is_empty() {
            return Err(PipelineError::Config(
                "select at least one column to keep".to_string(),
            ));
        }
        let mut requested = HashSet::with_capacity(keep.len());
        for name in keep {
            if schema.column_index(name).is_none() {
                return Err(PipelineError::Config(format!(
                    "column '{name}' is not present in the source header"
                )));
            }
            requested.insert(name.as_str());
        }
        let indices = schema
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| requested.contains(column.name.as_str()))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        debug!("Projection keeps column indices {indices:?}");
        Ok(Self::from_indices(indices, schema.columns.len()))
    }

    pub fn all(schema: &Schema) -> Self {
        Self::from_indices((0..schema.columns.len()).collect(), schema.columns.len())
    }

    fn from_indices(indices: Vec<usize>, width: usize) -> Self {
        let identity = indices.len() == width;
        Self { indices, identity }
    }

    pub fn project(&self, mut row: Row) -> Row {
        if self.identity {
            return row;
        }
        self.indices
            .iter()
            .map(|&idx| row.get_mut(idx).and_then(Option::take))
            .collect()
    }

    /// The schema of projected rows.
    pub fn project_schema(&self, schema: &Schema) -> Schema {
        let columns: Vec<ColumnMeta> = self
            .indices
            .iter()
            .map(|&idx| schema.columns[idx].clone())
            .collect();
        Schema::new(columns)
    }
}
