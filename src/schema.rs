//! Schema model, header normalisation, sniffing and YAML persistence.
//!
//! A [`Schema`] is derived once per run by [`sniff`] from a bounded prefix of
//! the source and is never mutated afterwards. Column names are unique and
//! their order defines the output column order.
//!
//! ## Type inference
//!
//! When inference is enabled every sampled non-null value narrows a
//! per-column candidate set. The narrowest surviving type wins in the order
//! integer, float, date (only when a date format is supplied), text. Columns
//! with no non-null samples are text.

use std::{collections::HashSet, fmt, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    data::{parse_date_with_format, parse_float, parse_integer},
    decode::NullPolicy,
    error::PipelineError,
    io_utils,
};

pub const DEFAULT_SAMPLE_ROWS: usize = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Date => "date",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub datatype: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, datatype: ColumnType) -> Self {
        Self {
            name: name.into(),
            datatype,
            date_format: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<ColumnMeta>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self { columns }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating schema file {path:?}"))?;
        serde_yaml::to_writer(file, self).context("Writing schema YAML")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let schema: Schema =
            serde_yaml::from_reader(BufReader::new(file)).context("Parsing schema YAML")?;
        Ok(schema)
    }

    /// Checks a loaded schema against the normalised header of the source.
    pub fn validate_headers(&self, headers: &[String]) -> Result<(), PipelineError> {
        let expected = self.headers();
        if expected.as_slice() != headers {
            return Err(PipelineError::Schema(format!(
                "schema columns [{}] do not match source header [{}]",
                expected.join(", "),
                headers.join(", ")
            )));
        }
        Ok(())
    }
}

/// How the source is read: separator, encoding, null tokens and the bounded
/// sample window used for type inference.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub separator: u8,
    pub encoding: &'static Encoding,
    pub sample_rows: usize,
    pub infer_types: bool,
    pub date_format: Option<String>,
    pub null_policy: NullPolicy,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            separator: io_utils::DEFAULT_SEPARATOR,
            encoding: encoding_rs::WINDOWS_1252,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            infer_types: true,
            date_format: None,
            null_policy: NullPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct TypeCandidate {
    non_null: usize,
    possible_integer: bool,
    possible_float: bool,
    possible_date: bool,
}

impl TypeCandidate {
    fn new(date_format: Option<&str>) -> Self {
        Self {
            non_null: 0,
            possible_integer: true,
            possible_float: true,
            possible_date: date_format.is_some(),
        }
    }

    fn update(&mut self, value: &str, date_format: Option<&str>) {
        self.non_null += 1;
        if self.possible_integer && parse_integer(value).is_err() {
            self.possible_integer = false;
        }
        if self.possible_float && parse_float(value).is_err() {
            self.possible_float = false;
        }
        if self.possible_date
            && date_format.is_none_or(|format| parse_date_with_format(value, format).is_err())
        {
            self.possible_date = false;
        }
    }

    fn decide(&self) -> ColumnType {
        if self.non_null == 0 {
            ColumnType::String
        } else if self.possible_integer {
            ColumnType::Integer
        } else if self.possible_float {
            ColumnType::Float
        } else if self.possible_date {
            ColumnType::Date
        } else {
            ColumnType::String
        }
    }
}

/// Makes header names non-empty and unique, keeping their order.
pub fn normalize_headers(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .enumerate()
        .map(|(idx, name)| {
            let trimmed = name.trim();
            let base = if trimmed.is_empty() {
                format!("field_{idx}")
            } else {
                trimmed.to_string()
            };
            let mut candidate = base.clone();
            let mut suffix = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{base}_{suffix}");
                suffix += 1;
            }
            candidate
        })
        .collect()
}

pub type SourceReader = csv::Reader<BufReader<File>>;

/// Opens `path` and consumes its header line, returning the reader positioned
/// on the first data record together with the normalised header names.
pub fn open_with_headers(
    path: &Path,
    separator: u8,
    encoding: &'static Encoding,
) -> Result<(SourceReader, Vec<String>), PipelineError> {
    let mut reader = io_utils::open_csv_reader_from_path(path, separator, false)
        .map_err(|err| PipelineError::io(format!("Opening source {path:?}"), err))?;
    let mut record = csv::ByteRecord::new();
    let found = reader
        .read_byte_record(&mut record)
        .map_err(|err| PipelineError::io(format!("Reading header of {path:?}"), err))?;
    if !found {
        return Err(PipelineError::Schema(format!("{path:?} has no header line")));
    }
    if record
        .iter()
        .all(|field| io_utils::strip_bom(field).trim_ascii().is_empty())
    {
        return Err(PipelineError::Schema(format!(
            "header line of {path:?} is empty"
        )));
    }
    let raw = io_utils::decode_headers(&record, encoding).map_err(|err| {
        PipelineError::Schema(format!("header line of {path:?} is not decodable: {err}"))
    })?;
    if raw.len() == 1 && raw[0].contains([',', ';', '\t', '|']) {
        warn!(
            "Header '{}' was read as a single column; the separator '{}' may be wrong",
            raw[0],
            io_utils::printable_separator(separator)
        );
    }
    Ok((reader, normalize_headers(&raw)))
}

/// Infers the schema of `path` from its header and at most
/// `options.sample_rows` data rows.
pub fn sniff(path: &Path, options: &SourceOptions) -> Result<Schema, PipelineError> {
    let (mut reader, headers) = open_with_headers(path, options.separator, options.encoding)?;
    let mut record = csv::ByteRecord::new();

    let date_format = options.date_format.as_deref();
    let mut candidates = vec![TypeCandidate::new(date_format); headers.len()];
    let mut sampled = 0usize;
    // The sample window is decoded even without inference so that a wrong
    // encoding is reported before the run starts.
    while sampled < options.sample_rows
        && reader
            .read_byte_record(&mut record)
            .map_err(|err| PipelineError::io(format!("Sampling {path:?}"), err))?
    {
        sampled += 1;
        for (idx, field) in record.iter().take(headers.len()).enumerate() {
            let value = io_utils::decode_bytes(field, options.encoding).map_err(|err| {
                PipelineError::Schema(format!(
                    "sample row {} of {path:?} is not decodable: {err}",
                    sampled + 1
                ))
            })?;
            if options.infer_types && !options.null_policy.is_null(&value) {
                candidates[idx].update(&value, date_format);
            }
        }
    }

    let columns = headers
        .into_iter()
        .zip(candidates)
        .map(|(name, candidate)| {
            let datatype = if options.infer_types {
                candidate.decide()
            } else {
                ColumnType::String
            };
            let mut column = ColumnMeta::new(name, datatype);
            if datatype == ColumnType::Date {
                column.date_format = options.date_format.clone();
            }
            column
        })
        .collect::<Vec<_>>();

    info!(
        "Sniffed {} column(s) from {:?} using {} sample row(s)",
        columns.len(),
        path,
        sampled
    );
    Ok(Schema::new(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::UTF_8;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn source(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents).expect("write source");
        file
    }

    fn options() -> SourceOptions {
        SourceOptions {
            encoding: UTF_8,
            ..SourceOptions::default()
        }
    }

    fn types(schema: &Schema) -> Vec<ColumnType> {
        schema.columns.iter().map(|c| c.datatype).collect()
    }

    #[test]
    fn sniff_prefers_the_narrowest_type() {
        let file = source(b"id;price;name;empty\n1;2.5;Ana;\n2;3;Luis;NA\n");
        let schema = sniff(file.path(), &options()).unwrap();
        assert_eq!(schema.headers(), vec!["id", "price", "name", "empty"]);
        assert_eq!(
            types(&schema),
            vec![
                ColumnType::Integer,
                ColumnType::Float,
                ColumnType::String,
                ColumnType::String
            ]
        );
    }

    #[test]
    fn mixed_columns_fall_back_to_text() {
        let file = source(b"code\n1\nA7\n");
        let schema = sniff(file.path(), &options()).unwrap();
        assert_eq!(types(&schema), vec![ColumnType::String]);
    }

    #[test]
    fn sample_window_bounds_inference() {
        let file = source(b"code\n1\n2\nabc\n");
        let opts = SourceOptions {
            sample_rows: 2,
            ..options()
        };
        let schema = sniff(file.path(), &opts).unwrap();
        assert_eq!(types(&schema), vec![ColumnType::Integer]);
    }

    #[test]
    fn inference_can_be_disabled() {
        let file = source(b"id;amount\n1;2.0\n");
        let opts = SourceOptions {
            infer_types: false,
            ..options()
        };
        let schema = sniff(file.path(), &opts).unwrap();
        assert_eq!(types(&schema), vec![ColumnType::String, ColumnType::String]);
    }

    #[test]
    fn undecodable_sample_fails_even_without_inference() {
        let file = source(b"name\nJos\xE9\n");
        let opts = SourceOptions {
            infer_types: false,
            ..options()
        };
        assert!(matches!(
            sniff(file.path(), &opts),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn date_columns_are_inferred_when_a_format_is_supplied() {
        let file = source(b"day;n\n01/31/2025;1\n02/01/2025;2\n");
        let opts = SourceOptions {
            date_format: Some("%m/%d/%Y".into()),
            ..options()
        };
        let schema = sniff(file.path(), &opts).unwrap();
        assert_eq!(types(&schema), vec![ColumnType::Date, ColumnType::Integer]);
        assert_eq!(schema.columns[0].date_format.as_deref(), Some("%m/%d/%Y"));
    }

    #[test]
    fn missing_or_blank_header_is_a_schema_error() {
        let empty = source(b"");
        assert!(matches!(
            sniff(empty.path(), &options()),
            Err(PipelineError::Schema(_))
        ));
        let blank = source(b" ; \n1;2\n");
        assert!(matches!(
            sniff(blank.path(), &options()),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn undecodable_sample_is_a_schema_error() {
        let file = source(b"name\nJos\xE9\n");
        let err = sniff(file.path(), &options()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));

        let latin = SourceOptions {
            encoding: encoding_rs::WINDOWS_1252,
            ..options()
        };
        assert!(sniff(file.path(), &latin).is_ok());
    }

    #[test]
    fn headers_are_made_unique_and_non_empty() {
        let raw = vec!["id".to_string(), "".to_string(), "id".to_string(), " id ".to_string()];
        assert_eq!(normalize_headers(&raw), vec!["id", "field_1", "id_1", "id_2"]);
    }

    #[test]
    fn bom_is_removed_from_first_header() {
        let file = source(b"\xEF\xBB\xBFid;name\n1;a\n");
        let schema = sniff(file.path(), &options()).unwrap();
        assert_eq!(schema.headers(), vec!["id", "name"]);
    }

    #[test]
    fn schema_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.yml");
        let mut schema = Schema::new(vec![
            ColumnMeta::new("id", ColumnType::Integer),
            ColumnMeta::new("day", ColumnType::Date),
        ]);
        schema.columns[1].date_format = Some("%d-%m-%Y".into());
        schema.save(&path).unwrap();
        assert_eq!(Schema::load(&path).unwrap(), schema);
    }
}
