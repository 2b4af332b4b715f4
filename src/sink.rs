//! Columnar artifact output.
//!
//! Surviving rows are written to Apache Parquet through `ArrowWriter`, one
//! record batch per `batch_rows` rows. The file is assembled under a temporary
//! name beside the destination and renamed into place only after the writer
//! closes, so a failed or cancelled run never leaves a truncated artifact.
//!
//! Column types come from [`TypeResolver`]: a numeric or date column that
//! received tolerated text values is written as UTF-8, every other column
//! keeps its declared type. The streaming strategy parks unique rows in a
//! [`Spool`] until the types are known.

use std::{
    fmt::Write as _,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow, bail};
use arrow_array::{
    Array, ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    builder::{Date32Builder, Float64Builder, Int64Builder, StringBuilder},
};
use arrow_schema::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::{
    data::{Row, Value},
    error::PipelineError,
    schema::{ColumnMeta, ColumnType, Schema},
};

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub const DEFAULT_BATCH_ROWS: usize = 65_536;

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub compression: Compression,
    pub batch_rows: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            compression: Compression::ZSTD(ZstdLevel::default()),
            batch_rows: DEFAULT_BATCH_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
    pub bytes: u64,
}

/// Tracks which declared columns must be widened to text.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    declared: Vec<ColumnType>,
    widened: Vec<bool>,
}

impl TypeResolver {
    pub fn new(schema: &Schema) -> Self {
        let declared = schema.columns.iter().map(|c| c.datatype).collect::<Vec<_>>();
        let widened = vec![false; declared.len()];
        Self { declared, widened }
    }

    pub fn observe(&mut self, row: &Row) {
        for (idx, value) in row.iter().enumerate() {
            if let Some(Value::Text(_)) = value
                && self.declared.get(idx).is_some_and(|ty| *ty != ColumnType::String)
            {
                self.widened[idx] = true;
            }
        }
    }

    pub fn resolve(&self) -> Vec<ColumnType> {
        self.declared
            .iter()
            .zip(&self.widened)
            .map(|(ty, widened)| if *widened { ColumnType::String } else { *ty })
            .collect()
    }
}

/// Keeps the first `limit` rows offered to it.
#[derive(Debug, Clone, Default)]
pub struct Preview {
    limit: usize,
    rows: Vec<Row>,
}

impl Preview {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            rows: Vec::with_capacity(limit.min(1024)),
        }
    }

    pub fn offer(&mut self, row: &Row) {
        if self.rows.len() < self.limit {
            self.rows.push(row.clone());
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Returns up to `n` leading rows without consuming the input.
pub fn preview(rows: &[Row], n: usize) -> Vec<Row> {
    rows.iter().take(n).cloned().collect()
}

/// Anonymous scratch file holding bincode-encoded rows. The file is unlinked
/// on creation, so dropping the spool releases it.
pub struct Spool {
    writer: BufWriter<File>,
    rows: usize,
}

impl Spool {
    pub fn new() -> Result<Self> {
        let file = tempfile::tempfile().context("Creating scratch spool")?;
        debug!("Opened scratch spool for unique rows");
        Ok(Self {
            writer: BufWriter::new(file),
            rows: 0,
        })
    }

    pub fn push(&mut self, row: &Row) -> Result<()> {
        bincode::serde::encode_into_std_write(row, &mut self.writer, bincode::config::standard())
            .context("Writing row to scratch spool")?;
        self.rows += 1;
        Ok(())
    }

    pub fn replay(self) -> Result<SpoolReader> {
        let mut file = self
            .writer
            .into_inner()
            .map_err(|err| anyhow!("Flushing scratch spool: {}", err.error()))?;
        file.seek(SeekFrom::Start(0))
            .context("Rewinding scratch spool")?;
        Ok(SpoolReader {
            reader: BufReader::new(file),
            remaining: self.rows,
        })
    }
}

pub struct SpoolReader {
    reader: BufReader<File>,
    remaining: usize,
}

impl Iterator for SpoolReader {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let row = bincode::serde::decode_from_std_read(&mut self.reader, bincode::config::standard())
            .context("Reading row from scratch spool");
        Some(row)
    }
}

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::String => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Date => DataType::Date32,
    }
}

fn arrow_schema(schema: &Schema, types: &[ColumnType]) -> SchemaRef {
    let fields = schema
        .columns
        .iter()
        .zip(types)
        .map(|(column, ty)| Field::new(column.name.as_str(), arrow_type(*ty), true))
        .collect::<Vec<_>>();
    Arc::new(ArrowSchema::new(fields))
}

/// Formats `date` with `format`, falling back to ISO when the layout cannot
/// render a date.
fn render_date(date: NaiveDate, format: &str) -> String {
    let mut rendered = String::new();
    if write!(rendered, "{}", date.format(format)).is_err() {
        return Value::Date(date).as_display();
    }
    rendered
}

enum ColumnBuilder {
    /// Utf8 output; `date_format` renders typed dates of a widened date
    /// column in the layout of the source text.
    Text {
        values: StringBuilder,
        date_format: Option<String>,
    },
    Integer(Int64Builder),
    Float(Float64Builder),
    Date(Date32Builder),
}

impl ColumnBuilder {
    fn new(ty: ColumnType, column: &ColumnMeta, capacity: usize) -> Self {
        match ty {
            ColumnType::String => ColumnBuilder::Text {
                values: StringBuilder::with_capacity(capacity, 0),
                date_format: column.date_format.clone(),
            },
            ColumnType::Integer => ColumnBuilder::Integer(Int64Builder::with_capacity(capacity)),
            ColumnType::Float => ColumnBuilder::Float(Float64Builder::with_capacity(capacity)),
            ColumnType::Date => ColumnBuilder::Date(Date32Builder::with_capacity(capacity)),
        }
    }

    fn append(&mut self, value: Option<&Value>) -> Result<()> {
        match (self, value) {
            (ColumnBuilder::Text { values, .. }, None) => values.append_null(),
            (ColumnBuilder::Integer(b), None) => b.append_null(),
            (ColumnBuilder::Float(b), None) => b.append_null(),
            (ColumnBuilder::Date(b), None) => b.append_null(),
            (ColumnBuilder::Text { values, .. }, Some(Value::Text(s))) => values.append_value(s),
            (
                ColumnBuilder::Text {
                    values,
                    date_format: Some(format),
                },
                Some(Value::Date(d)),
            ) => values.append_value(render_date(*d, format)),
            (ColumnBuilder::Text { values, .. }, Some(other)) => {
                values.append_value(other.as_display())
            }
            (ColumnBuilder::Integer(b), Some(Value::Integer(i))) => b.append_value(*i),
            (ColumnBuilder::Float(b), Some(Value::Float(f))) => b.append_value(*f),
            (ColumnBuilder::Float(b), Some(Value::Integer(i))) => b.append_value(*i as f64),
            (ColumnBuilder::Date(b), Some(Value::Date(d))) => {
                b.append_value(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
            }
            (_, Some(other)) => bail!("Value '{other}' does not match its column type"),
        }
        Ok(())
    }

    /// Drains the builder; it stays usable for the next batch.
    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Text { values, .. } => Arc::new(values.finish()),
            ColumnBuilder::Integer(b) => Arc::new(b.finish()),
            ColumnBuilder::Float(b) => Arc::new(b.finish()),
            ColumnBuilder::Date(b) => Arc::new(b.finish()),
        }
    }
}

struct BatchBuilder {
    schema: SchemaRef,
    columns: Vec<ColumnBuilder>,
    capacity: usize,
    rows: usize,
}

impl BatchBuilder {
    fn new(arrow_schema: SchemaRef, schema: &Schema, types: &[ColumnType], capacity: usize) -> Self {
        let columns = types
            .iter()
            .zip(&schema.columns)
            .map(|(ty, column)| ColumnBuilder::new(*ty, column, capacity))
            .collect();
        Self {
            schema: arrow_schema,
            columns,
            capacity,
            rows: 0,
        }
    }

    fn push(&mut self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            bail!(
                "Row has {} value(s) but the artifact has {} column(s)",
                row.len(),
                self.columns.len()
            );
        }
        for (builder, value) in self.columns.iter_mut().zip(row) {
            builder.append(value.as_ref())?;
        }
        self.rows += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.rows >= self.capacity
    }

    fn take(&mut self) -> Result<RecordBatch> {
        let arrays = self.columns.iter_mut().map(ColumnBuilder::finish).collect();
        self.rows = 0;
        RecordBatch::try_new(self.schema.clone(), arrays).context("Assembling record batch")
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), PipelineError> {
    if cancel.load(Ordering::Relaxed) {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Writes `rows` as a Parquet artifact at `destination`.
pub fn write<I>(
    rows: I,
    schema: &Schema,
    types: &[ColumnType],
    destination: &Path,
    options: &SinkOptions,
    cancel: &AtomicBool,
) -> Result<ArtifactHandle, PipelineError>
where
    I: IntoIterator<Item = Result<Row>>,
{
    let parent = match destination.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(parent)
        .map_err(|err| PipelineError::io(format!("Creating artifact in {parent:?}"), err))?;
    let file = temp
        .as_file()
        .try_clone()
        .map_err(|err| PipelineError::io("Opening artifact for writing", err))?;

    let arrow_schema = arrow_schema(schema, types);
    let props = WriterProperties::builder()
        .set_compression(options.compression)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), arrow_schema.clone(), Some(props))
        .map_err(|err| PipelineError::io("Starting Parquet writer", err))?;
    let batch_rows = options.batch_rows.max(1);
    let mut batch = BatchBuilder::new(arrow_schema, schema, types, batch_rows);
    let mut written = 0usize;

    for row in rows {
        let row = row.map_err(|err| PipelineError::io("Reading surviving rows", err))?;
        batch
            .push(&row)
            .map_err(|err| PipelineError::io("Encoding row for artifact", err))?;
        if batch.is_full() {
            check_cancelled(cancel)?;
            written += flush_batch(&mut writer, &mut batch)?;
        }
    }
    check_cancelled(cancel)?;
    if batch.rows > 0 {
        written += flush_batch(&mut writer, &mut batch)?;
    }
    writer
        .close()
        .map_err(|err| PipelineError::io("Finalizing Parquet artifact", err))?;

    let persisted = temp.persist(destination).map_err(|err| {
        PipelineError::io(format!("Moving artifact into place at {destination:?}"), err.error)
    })?;
    let bytes = persisted
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| PipelineError::io(format!("Inspecting {destination:?}"), err))?;
    info!(
        "Wrote {} row(s) across {} column(s) to {:?} ({} bytes)",
        written,
        schema.columns.len(),
        destination,
        bytes
    );
    Ok(ArtifactHandle {
        path: destination.to_path_buf(),
        rows: written,
        columns: schema.headers(),
        bytes,
    })
}

fn flush_batch<W: Write + Send>(
    writer: &mut ArrowWriter<W>,
    batch: &mut BatchBuilder,
) -> Result<usize, PipelineError> {
    let record_batch = batch
        .take()
        .map_err(|err| PipelineError::io("Building record batch", err))?;
    writer
        .write(&record_batch)
        .map_err(|err| PipelineError::io("Writing record batch", err))?;
    debug!("Flushed batch of {} row(s)", record_batch.num_rows());
    Ok(record_batch.num_rows())
}

/// Reads an artifact back as a schema plus up to `limit` rows (all rows when
/// `limit` is `None`).
pub fn read_artifact(path: &Path, limit: Option<usize>) -> Result<(Schema, Vec<Row>)> {
    let file = File::open(path).with_context(|| format!("Opening artifact {path:?}"))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Reading Parquet metadata from {path:?}"))?;
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let datatype = match field.data_type() {
                DataType::Int64 => ColumnType::Integer,
                DataType::Float64 => ColumnType::Float,
                DataType::Date32 => ColumnType::Date,
                DataType::Utf8 => ColumnType::String,
                other => bail!("Unsupported artifact column type {other} for '{}'", field.name()),
            };
            Ok(ColumnMeta::new(field.name().as_str(), datatype))
        })
        .collect::<Result<Vec<_>>>()?;
    let schema = Schema::new(columns);
    let reader = builder
        .build()
        .with_context(|| format!("Opening Parquet reader for {path:?}"))?;

    let limit = limit.unwrap_or(usize::MAX);
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("Decoding record batch from {path:?}"))?;
        for idx in 0..batch.num_rows() {
            if rows.len() >= limit {
                return Ok((schema, rows));
            }
            let row = batch
                .columns()
                .iter()
                .map(|array| read_cell(array, idx))
                .collect::<Result<Row>>()?;
            rows.push(row);
        }
    }
    Ok((schema, rows))
}

fn read_cell(array: &ArrayRef, idx: usize) -> Result<Option<Value>> {
    if array.is_null(idx) {
        return Ok(None);
    }
    let any = array.as_any();
    let value = if let Some(values) = any.downcast_ref::<Int64Array>() {
        Value::Integer(values.value(idx))
    } else if let Some(values) = any.downcast_ref::<Float64Array>() {
        Value::Float(values.value(idx))
    } else if let Some(values) = any.downcast_ref::<StringArray>() {
        Value::Text(values.value(idx).to_string())
    } else if let Some(values) = any.downcast_ref::<Date32Array>() {
        let days = values.value(idx) + UNIX_EPOCH_DAYS_FROM_CE;
        let date = NaiveDate::from_num_days_from_ce_opt(days)
            .ok_or_else(|| anyhow!("Date32 value {} is out of range", values.value(idx)))?;
        Value::Date(date)
    } else {
        bail!("Unsupported array type {}", array.data_type());
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnMeta::new("id", ColumnType::Integer),
            ColumnMeta::new("name", ColumnType::String),
            ColumnMeta::new("day", ColumnType::Date),
        ])
    }

    fn rows() -> Vec<Row> {
        let day = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        vec![
            vec![
                Some(Value::Integer(1)),
                Some(Value::Text("Ana".into())),
                Some(Value::Date(day)),
            ],
            vec![Some(Value::Integer(2)), None, None],
        ]
    }

    fn never() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn written_artifact_reads_back_with_types() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.parquet");
        let schema = schema();
        let types = TypeResolver::new(&schema).resolve();
        let handle = write(
            rows().into_iter().map(Ok),
            &schema,
            &types,
            &dest,
            &SinkOptions::default(),
            &never(),
        )
        .unwrap();
        assert_eq!(handle.rows, 2);
        assert_eq!(handle.columns, vec!["id", "name", "day"]);

        let (read_schema, read_rows) = read_artifact(&dest, None).unwrap();
        assert_eq!(read_schema, schema);
        assert_eq!(read_rows, rows());
    }

    #[test]
    fn text_fallbacks_widen_the_column() {
        let schema = schema();
        let mut resolver = TypeResolver::new(&schema);
        resolver.observe(&vec![
            Some(Value::Text("x1".into())),
            Some(Value::Text("Ana".into())),
            None,
        ]);
        assert_eq!(
            resolver.resolve(),
            vec![ColumnType::String, ColumnType::String, ColumnType::Date]
        );

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("wide.parquet");
        let mixed = vec![
            vec![Some(Value::Text("x1".into())), None, None],
            vec![Some(Value::Integer(7)), None, None],
        ];
        write(
            mixed.into_iter().map(Ok),
            &schema,
            &resolver.resolve(),
            &dest,
            &SinkOptions::default(),
            &never(),
        )
        .unwrap();
        let (_, read_rows) = read_artifact(&dest, None).unwrap();
        assert_eq!(read_rows[1][0], Some(Value::Text("7".into())));
    }

    #[test]
    fn small_batches_produce_the_same_rows() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("batched.parquet");
        let schema = schema();
        let types = TypeResolver::new(&schema).resolve();
        let options = SinkOptions {
            batch_rows: 1,
            ..SinkOptions::default()
        };
        write(rows().into_iter().map(Ok), &schema, &types, &dest, &options, &never()).unwrap();
        let (_, read_rows) = read_artifact(&dest, Some(1)).unwrap();
        assert_eq!(read_rows, rows()[..1].to_vec());
    }

    #[test]
    fn unwritable_destination_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing").join("out.parquet");
        let schema = schema();
        let types = TypeResolver::new(&schema).resolve();
        let err = write(
            rows().into_iter().map(Ok),
            &schema,
            &types,
            &dest,
            &SinkOptions::default(),
            &never(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn failure_mid_write_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("broken.parquet");
        let schema = schema();
        let types = TypeResolver::new(&schema).resolve();
        let rows = vec![Ok(rows()[0].clone()), Err(anyhow!("source vanished"))];
        let err = write(rows, &schema, &types, &dest, &SinkOptions::default(), &never())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancelled_write_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cancelled.parquet");
        let schema = schema();
        let types = TypeResolver::new(&schema).resolve();
        let cancel = AtomicBool::new(true);
        let err = write(
            rows().into_iter().map(Ok),
            &schema,
            &types,
            &dest,
            &SinkOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn cancellation_after_flushed_batches_discards_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("interrupted.parquet");
        let schema = schema();
        let types = TypeResolver::new(&schema).resolve();
        let options = SinkOptions {
            batch_rows: 1,
            ..SinkOptions::default()
        };
        let cancel = AtomicBool::new(false);
        let source = (0..50i64).map(|id| {
            if id == 3 {
                cancel.store(true, Ordering::Relaxed);
            }
            Ok(vec![Some(Value::Integer(id)), None, None])
        });
        let err = write(source, &schema, &types, &dest, &options, &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn widened_date_column_keeps_the_source_layout() {
        let mut schema = schema();
        schema.columns[2].date_format = Some("%m/%d/%Y".into());
        let day = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let mixed = vec![
            vec![Some(Value::Integer(1)), None, Some(Value::Date(day))],
            vec![Some(Value::Integer(2)), None, Some(Value::Text("13/40/2025".into()))],
        ];
        let mut resolver = TypeResolver::new(&schema);
        for row in &mixed {
            resolver.observe(row);
        }
        let types = resolver.resolve();
        assert_eq!(types[2], ColumnType::String);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dates.parquet");
        write(
            mixed.into_iter().map(Ok),
            &schema,
            &types,
            &dest,
            &SinkOptions::default(),
            &never(),
        )
        .unwrap();
        let (_, read_rows) = read_artifact(&dest, None).unwrap();
        assert_eq!(read_rows[0][2], Some(Value::Text("01/05/2025".into())));
        assert_eq!(read_rows[1][2], Some(Value::Text("13/40/2025".into())));
    }

    #[test]
    fn spool_replays_rows_in_order() {
        let mut spool = Spool::new().unwrap();
        for row in rows() {
            spool.push(&row).unwrap();
        }
        let replayed = spool.replay().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(replayed, rows());
    }

    #[test]
    fn preview_keeps_leading_rows_only() {
        let mut collector = Preview::new(1);
        for row in rows() {
            collector.offer(&row);
        }
        assert_eq!(collector.into_rows(), rows()[..1].to_vec());
        assert_eq!(preview(&rows(), 5), rows());
        assert!(preview(&rows(), 0).is_empty());
    }
}
