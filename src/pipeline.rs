//! Run orchestration.
//!
//! The pipeline is a typestate chain mirroring the run lifecycle:
//! [`Pipeline`] (idle) → [`SniffedPipeline`] → [`ConfiguredPipeline`] →
//! [`ConfiguredPipeline::run`], which consumes the instance and ends either in
//! a [`RunSummary`] or a [`PipelineError`]. Configuration errors surface
//! before any data row is read.
//!
//! Rows flow forward only: decode → date filter → projection → dedup → sink.
//! The date filter sees the full decoded row so the date column does not
//! need to be kept. Both strategies admit rows to the deduplicator in input
//! order and feed the sink the same row sequence, so their artifacts are
//! byte-identical.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::NaiveDate;
use csv::ByteRecord;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    data::Row,
    decode::{DecodeMode, DecodeStats, Decoded, RowDecoder},
    dedup::Deduplicator,
    error::PipelineError,
    io_utils,
    projection::Projection,
    range::DateRange,
    schema::{self, Schema, SourceOptions, SourceReader},
    sink::{self, ArtifactHandle, Preview, SinkOptions, Spool, TypeResolver},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Materialize every decoded row, then deduplicate the table.
    Eager,
    /// Deduplicate row by row, spooling only unique rows.
    #[default]
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFilter {
    pub column: String,
    pub format: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Columns to keep; `None` keeps all of them.
    pub columns: Option<Vec<String>>,
    pub date_filter: Option<DateFilter>,
    pub mode: DecodeMode,
    pub strategy: Strategy,
    pub preview_rows: usize,
    pub sink: SinkOptions,
    pub cancel: Arc<AtomicBool>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            columns: None,
            date_filter: None,
            mode: DecodeMode::default(),
            strategy: Strategy::default(),
            preview_rows: 10,
            sink: SinkOptions::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub artifact: ArtifactHandle,
    pub strategy: Strategy,
    /// Data records read from the source.
    pub records_scanned: usize,
    /// Records dropped by strict decoding.
    pub rows_skipped: usize,
    /// Records excluded by the date filter.
    pub rows_out_of_range: usize,
    /// Rows offered to the deduplicator.
    pub total_rows_read: usize,
    pub duplicates_removed: usize,
    pub rows_written: usize,
    pub ragged_rows: usize,
    pub coercion_fallbacks: usize,
    pub replaced_fields: usize,
    #[serde(skip)]
    pub preview: Vec<Row>,
}

/// Idle pipeline: knows where the source is and how to read it.
#[derive(Debug, Clone)]
pub struct Pipeline {
    source: PathBuf,
    options: SourceOptions,
}

impl Pipeline {
    pub fn new(source: impl Into<PathBuf>, options: SourceOptions) -> Self {
        Self {
            source: source.into(),
            options,
        }
    }

    pub fn sniff(self) -> Result<SniffedPipeline, PipelineError> {
        let schema = schema::sniff(&self.source, &self.options)?;
        Ok(SniffedPipeline {
            source: self.source,
            options: self.options,
            schema,
        })
    }

    /// Uses a previously saved schema instead of inferring one. The header
    /// of the source must still match it.
    pub fn with_schema(self, schema: Schema) -> Result<SniffedPipeline, PipelineError> {
        let (_, headers) =
            schema::open_with_headers(&self.source, self.options.separator, self.options.encoding)?;
        schema.validate_headers(&headers)?;
        Ok(SniffedPipeline {
            source: self.source,
            options: self.options,
            schema,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SniffedPipeline {
    source: PathBuf,
    options: SourceOptions,
    schema: Schema,
}

impl SniffedPipeline {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn configure(self, config: RunConfig) -> Result<ConfiguredPipeline, PipelineError> {
        let projection = match config.columns.as_deref() {
            Some(columns) => Projection::new(&self.schema, columns)?,
            None => Projection::all(&self.schema),
        };
        let range = config
            .date_filter
            .as_ref()
            .map(|filter| {
                DateRange::new(
                    &self.schema,
                    &filter.column,
                    &filter.format,
                    filter.from,
                    filter.to,
                )
            })
            .transpose()?;
        let output_schema = projection.project_schema(&self.schema);
        info!(
            "Configured run: keeping [{}]{}",
            output_schema.headers().join(", "),
            range
                .as_ref()
                .map(|r| format!(", date filter on '{}'", r.column()))
                .unwrap_or_default()
        );
        Ok(ConfiguredPipeline {
            source: self.source,
            options: self.options,
            schema: self.schema,
            projection,
            range,
            output_schema,
            config,
        })
    }
}

#[derive(Debug)]
pub struct ConfiguredPipeline {
    source: PathBuf,
    options: SourceOptions,
    schema: Schema,
    projection: Projection,
    range: Option<DateRange>,
    output_schema: Schema,
    config: RunConfig,
}

#[derive(Debug, Default)]
struct ScanCounts {
    out_of_range: usize,
    offered: usize,
}

struct Collected {
    duplicates: usize,
    preview: Vec<Row>,
    artifact: ArtifactHandle,
}

impl ConfiguredPipeline {
    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    /// Setting the returned flag aborts the run at the next row or batch.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.config.cancel)
    }

    pub fn run(self, destination: &Path) -> Result<RunSummary, PipelineError> {
        info!(
            "Running {:?} strategy on {:?} (separator '{}', encoding {}) -> {:?}",
            self.config.strategy,
            self.source,
            io_utils::printable_separator(self.options.separator),
            self.options.encoding.name(),
            destination
        );
        let outcome = self.execute(destination);
        match &outcome {
            Ok(summary) => {
                info!(
                    "Completed: {} row(s) read, {} duplicate(s) removed, {} row(s) written",
                    summary.total_rows_read, summary.duplicates_removed, summary.rows_written
                );
                if summary.rows_skipped > 0 || summary.replaced_fields > 0 {
                    warn!(
                        "{} row(s) skipped by strict decoding, {} field(s) with undecodable bytes replaced",
                        summary.rows_skipped, summary.replaced_fields
                    );
                }
            }
            Err(err) => warn!("Run failed ({}): {err}", err.kind()),
        }
        outcome
    }

    fn execute(&self, destination: &Path) -> Result<RunSummary, PipelineError> {
        let (reader, headers) =
            schema::open_with_headers(&self.source, self.options.separator, self.options.encoding)?;
        if headers.len() != self.schema.columns.len() {
            return Err(PipelineError::Schema(format!(
                "source header changed since it was sniffed ({} column(s), expected {})",
                headers.len(),
                self.schema.columns.len()
            )));
        }
        let mut decoder = RowDecoder::new(
            &self.schema,
            self.options.encoding,
            &self.options.null_policy,
            self.config.mode,
        );

        let (counts, collected) = match self.config.strategy {
            Strategy::Eager => self.run_eager(reader, &mut decoder, destination)?,
            Strategy::Streaming => self.run_streaming(reader, &mut decoder, destination)?,
        };
        let stats: DecodeStats = decoder.stats();
        let rows_written = collected.artifact.rows;
        debug_assert_eq!(
            stats.records,
            counts.offered + stats.rows_skipped + counts.out_of_range
        );
        debug_assert_eq!(rows_written, counts.offered - collected.duplicates);

        Ok(RunSummary {
            artifact: collected.artifact,
            strategy: self.config.strategy,
            records_scanned: stats.records,
            rows_skipped: stats.rows_skipped,
            rows_out_of_range: counts.out_of_range,
            total_rows_read: counts.offered,
            duplicates_removed: collected.duplicates,
            rows_written,
            ragged_rows: stats.ragged_rows,
            coercion_fallbacks: stats.coercion_fallbacks,
            replaced_fields: stats.replaced_fields,
            preview: collected.preview,
        })
    }

    /// Decodes, filters and projects every record, handing surviving rows to
    /// `admit` in input order.
    fn scan<F>(
        &self,
        mut reader: SourceReader,
        decoder: &mut RowDecoder<'_>,
        mut admit: F,
    ) -> Result<ScanCounts, PipelineError>
    where
        F: FnMut(Row) -> Result<(), PipelineError>,
    {
        let mut counts = ScanCounts::default();
        let mut record = ByteRecord::new();
        loop {
            if self.config.cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
            let more = reader.read_byte_record(&mut record).map_err(|err| {
                PipelineError::io(format!("Reading {:?}", self.source), err)
            })?;
            if !more {
                break;
            }
            let row = match decoder.decode(&record) {
                Decoded::Row(row) => row,
                Decoded::Skip(reason) => {
                    debug!("Skipped record: {reason:?}");
                    continue;
                }
            };
            if let Some(range) = &self.range
                && !range.include(&row)
            {
                counts.out_of_range += 1;
                continue;
            }
            counts.offered += 1;
            admit(self.projection.project(row))?;
        }
        Ok(counts)
    }

    fn run_eager(
        &self,
        reader: SourceReader,
        decoder: &mut RowDecoder<'_>,
        destination: &Path,
    ) -> Result<(ScanCounts, Collected), PipelineError> {
        let mut table: Vec<Row> = Vec::new();
        let counts = self.scan(reader, decoder, |row| {
            table.push(row);
            Ok(())
        })?;
        debug!("Materialized {} row(s) before deduplication", table.len());

        let mut dedup = Deduplicator::new();
        table.retain(|row| dedup.admit_row(row));
        let duplicates = dedup.duplicates();
        drop(dedup);

        let mut resolver = TypeResolver::new(&self.output_schema);
        for row in &table {
            resolver.observe(row);
        }
        let preview = sink::preview(&table, self.config.preview_rows);
        let artifact = sink::write(
            table.into_iter().map(Ok),
            &self.output_schema,
            &resolver.resolve(),
            destination,
            &self.config.sink,
            &self.config.cancel,
        )?;
        Ok((
            counts,
            Collected {
                duplicates,
                preview,
                artifact,
            },
        ))
    }

    fn run_streaming(
        &self,
        reader: SourceReader,
        decoder: &mut RowDecoder<'_>,
        destination: &Path,
    ) -> Result<(ScanCounts, Collected), PipelineError> {
        let mut dedup = Deduplicator::new();
        let mut resolver = TypeResolver::new(&self.output_schema);
        let mut preview = Preview::new(self.config.preview_rows);
        let mut spool =
            Spool::new().map_err(|err| PipelineError::io("Creating scratch spool", err))?;

        let counts = self.scan(reader, decoder, |row| {
            if dedup.admit_row(&row) {
                resolver.observe(&row);
                preview.offer(&row);
                spool
                    .push(&row)
                    .map_err(|err| PipelineError::io("Spooling unique row", err))?;
            }
            Ok(())
        })?;
        let duplicates = dedup.duplicates();
        debug!(
            "Streaming pass kept {} distinct row(s) of {}",
            dedup.distinct(),
            counts.offered
        );
        drop(dedup);

        let rows = spool
            .replay()
            .map_err(|err| PipelineError::io("Replaying scratch spool", err))?;
        let artifact = sink::write(
            rows,
            &self.output_schema,
            &resolver.resolve(),
            destination,
            &self.config.sink,
            &self.config.cancel,
        )?;
        Ok((
            counts,
            Collected {
                duplicates,
                preview: preview.into_rows(),
                artifact,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use encoding_rs::UTF_8;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn source(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write source");
        file
    }

    fn options() -> SourceOptions {
        SourceOptions {
            encoding: UTF_8,
            ..SourceOptions::default()
        }
    }

    fn run(input: &str, config: RunConfig) -> (TempDir, Result<RunSummary, PipelineError>) {
        let file = source(input);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.parquet");
        let outcome = Pipeline::new(file.path(), options())
            .sniff()
            .and_then(|p| p.configure(config))
            .and_then(|p| p.run(&dest));
        (dir, outcome)
    }

    #[test]
    fn removes_exact_duplicates_in_first_occurrence_order() {
        let (_dir, outcome) = run("id;name\n1;Ana\n2;Ana\n1;Ana\n", RunConfig::default());
        let summary = outcome.unwrap();
        assert_eq!(summary.total_rows_read, 3);
        assert_eq!(summary.duplicates_removed, 1);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(
            summary.preview,
            vec![
                vec![Some(Value::Integer(1)), Some(Value::Text("Ana".into()))],
                vec![Some(Value::Integer(2)), Some(Value::Text("Ana".into()))],
            ]
        );
    }

    #[test]
    fn strategies_write_identical_artifacts() {
        let input = "id;name;score\n1;Ana;2.5\n2;Luis;x\n1;Ana;2.5\n3;;\n3;NA;\n";
        let file = source(input);
        let dir = tempfile::tempdir().unwrap();
        let mut artifacts = Vec::new();
        for strategy in [Strategy::Eager, Strategy::Streaming] {
            let dest = dir.path().join(format!("{strategy:?}.parquet"));
            let config = RunConfig {
                strategy,
                ..RunConfig::default()
            };
            let summary = Pipeline::new(file.path(), options())
                .sniff()
                .and_then(|p| p.configure(config))
                .and_then(|p| p.run(&dest))
                .unwrap();
            assert_eq!(summary.duplicates_removed, 2);
            artifacts.push(std::fs::read(&dest).unwrap());
        }
        assert_eq!(artifacts[0], artifacts[1]);
    }

    #[test]
    fn configuration_errors_abort_before_running() {
        let file = source("id;name\n1;Ana\n");
        let sniffed = Pipeline::new(file.path(), options()).sniff().unwrap();
        let err = sniffed
            .clone()
            .configure(RunConfig {
                columns: Some(Vec::new()),
                ..RunConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let err = sniffed
            .configure(RunConfig {
                date_filter: Some(DateFilter {
                    column: "missing".into(),
                    format: "%Y-%m-%d".into(),
                    from: None,
                    to: None,
                }),
                ..RunConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn cancelled_run_leaves_no_artifact() {
        let file = source("id;name\n1;Ana\n2;Luis\n");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.parquet");
        let configured = Pipeline::new(file.path(), options())
            .sniff()
            .unwrap()
            .configure(RunConfig::default())
            .unwrap();
        configured.cancel_handle().store(true, Ordering::Relaxed);
        let err = configured.run(&dest).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn strict_mode_counts_skipped_rows() {
        let config = RunConfig {
            mode: DecodeMode::Strict,
            ..RunConfig::default()
        };
        let (_dir, outcome) = run("id;name\n1;Ana\n1;Ana;extra\n2;Luis\n", config);
        let summary = outcome.unwrap();
        assert_eq!(summary.records_scanned, 3);
        assert_eq!(summary.rows_skipped, 1);
        assert_eq!(summary.total_rows_read, 2);
        assert_eq!(summary.rows_written, 2);
    }

    #[test]
    fn date_filter_may_use_a_dropped_column() {
        let config = RunConfig {
            columns: Some(vec!["name".into()]),
            date_filter: Some(DateFilter {
                column: "day".into(),
                format: "%m/%d/%Y".into(),
                from: NaiveDate::from_ymd_opt(2025, 1, 1),
                to: NaiveDate::from_ymd_opt(2025, 1, 31),
            }),
            ..RunConfig::default()
        };
        let input = "name;day\nAna;01/05/2025\nLuis;13/40/2025\nEva;02/01/2025\nAna;01/20/2025\n";
        let (_dir, outcome) = run(input, config);
        let summary = outcome.unwrap();
        assert_eq!(summary.records_scanned, 4);
        assert_eq!(summary.rows_out_of_range, 2);
        assert_eq!(summary.total_rows_read, 2);
        assert_eq!(summary.duplicates_removed, 1);
        assert_eq!(summary.artifact.columns, vec!["name"]);
    }
}
