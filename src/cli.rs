use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use parquet::basic::{Compression, ZstdLevel};

use crate::{decode::DecodeMode, pipeline::Strategy};

#[derive(Debug, Parser)]
#[command(author, version, about = "Normalize and deduplicate delimited tables into Parquet", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sniff the header and column types of a delimited file
    Probe(ProbeArgs),
    /// Decode, filter, project and deduplicate a file into a Parquet artifact
    Clean(CleanArgs),
    /// Show the column layout and first rows of a Parquet artifact
    Inspect(InspectArgs),
}

/// How the source file is read; shared by `probe` and `clean`.
#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Input delimited file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Field separator (supports ',', ';', 'tab', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub separator: Option<u8>,
    /// Character encoding of the input file (defaults to latin1)
    #[arg(long)]
    pub encoding: Option<String>,
    /// Number of rows sampled when inferring column types
    #[arg(long, default_value_t = crate::schema::DEFAULT_SAMPLE_ROWS)]
    pub sample_rows: usize,
    /// Treat every column as text instead of inferring types
    #[arg(long = "no-infer")]
    pub no_infer: bool,
    /// Tokens decoded as null (replaces the defaults when given)
    #[arg(long = "null-values", value_delimiter = ',', num_args = 1..)]
    pub null_values: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// strftime layout used to recognise date columns
    #[arg(long = "date-format")]
    pub date_format: Option<String>,
    /// Persist the sniffed schema as YAML
    #[arg(long)]
    pub save: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CleanArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Destination Parquet artifact
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
    /// Keep only these columns (comma-separated, original order is preserved)
    #[arg(short = 'C', long = "columns", value_delimiter = ',', action = clap::ArgAction::Append)]
    pub columns: Vec<String>,
    /// Schema file produced by `probe --save`, used instead of sniffing
    #[arg(long)]
    pub schema: Option<PathBuf>,
    /// Column holding the date used by --from/--to
    #[arg(long = "date-column")]
    pub date_column: Option<String>,
    /// Inclusive lower date bound (YYYY-MM-DD)
    #[arg(long, requires = "date_column")]
    pub from: Option<String>,
    /// Inclusive upper date bound (YYYY-MM-DD)
    #[arg(long, requires = "date_column")]
    pub to: Option<String>,
    /// strftime layout of the date column values
    #[arg(long = "date-format")]
    pub date_format: Option<String>,
    /// Drop malformed rows instead of repairing them
    #[arg(long)]
    pub strict: bool,
    /// Execution strategy
    #[arg(long, value_enum, default_value = "streaming")]
    pub strategy: StrategyArg,
    /// Number of preview rows to print after the run
    #[arg(long, default_value_t = 10)]
    pub preview: usize,
    /// Parquet compression codec
    #[arg(long, value_enum, default_value = "zstd")]
    pub compression: Codec,
    /// Write the run summary as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl CleanArgs {
    pub fn decode_mode(&self) -> DecodeMode {
        if self.strict {
            DecodeMode::Strict
        } else {
            DecodeMode::Tolerant
        }
    }
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Parquet artifact to inspect
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Number of rows to display
    #[arg(long, default_value_t = 10)]
    pub rows: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum StrategyArg {
    Eager,
    Streaming,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Eager => Strategy::Eager,
            StrategyArg::Streaming => Strategy::Streaming,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum Codec {
    Zstd,
    Snappy,
    None,
}

impl Codec {
    pub fn compression(self) -> Compression {
        match self {
            Codec::Zstd => Compression::ZSTD(ZstdLevel::default()),
            Codec::Snappy => Compression::SNAPPY,
            Codec::None => Compression::UNCOMPRESSED,
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => Err(format!(
            "Unsupported separator '{other}' (expected ',', ';', 'tab' or '|')"
        )),
    }
}
