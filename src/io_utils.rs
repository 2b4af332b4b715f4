//! I/O utilities for delimited-text reading and byte decoding.
//!
//! All source reads in csv-dedupe flow through this module. It provides:
//!
//! - **Separator resolution**: the small set of accepted separators and a
//!   printable form for log lines.
//! - **Encoding**: label resolution and byte decoding via `encoding_rs`, either
//!   strict (the sniffer rejects undecodable samples) or lossy (the row decoder
//!   replaces bad sequences with U+FFFD).
//! - **Reader construction**: flexible CSV readers so ragged rows reach the
//!   row decoder instead of failing inside the parser.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::{Encoding, UTF_8};

pub const DEFAULT_SEPARATOR: u8 = b';';
pub const DEFAULT_ENCODING_LABEL: &str = "latin1";
pub const REPLACEMENT_MARKER: char = '\u{FFFD}';

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn printable_separator(separator: u8) -> String {
    match separator {
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}

pub fn open_csv_reader<R>(reader: R, separator: u8, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(separator)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn open_csv_reader_from_path(
    path: &Path,
    separator: u8,
    has_headers: bool,
) -> Result<csv::Reader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
    Ok(open_csv_reader(BufReader::new(file), separator, has_headers))
}

/// Decodes a field, failing on any sequence that is invalid under `encoding`.
pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    match encoding.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(text) => Ok(text.into_owned()),
        None => Err(anyhow!(
            "Failed to decode text with encoding {}",
            encoding.name()
        )),
    }
}

/// Decodes a field, substituting [`REPLACEMENT_MARKER`] for invalid sequences.
///
/// The boolean reports whether any replacement happened.
pub fn decode_bytes_lossy(bytes: &[u8], encoding: &'static Encoding) -> (String, bool) {
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    (text.into_owned(), had_errors)
}

pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

pub fn decode_headers(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
) -> Result<Vec<String>> {
    record
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let field = if idx == 0 { strip_bom(field) } else { field };
            decode_bytes(field, encoding)
        })
        .collect()
}
