pub mod cli;
pub mod data;
pub mod decode;
pub mod dedup;
pub mod error;
pub mod io_utils;
pub mod pipeline;
pub mod projection;
pub mod range;
pub mod schema;
pub mod sink;
pub mod table;

use std::{env, fs::File, io::BufWriter, path::Path, sync::OnceLock};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{CleanArgs, Cli, Commands, InspectArgs, ProbeArgs, SourceArgs},
    decode::NullPolicy,
    error::PipelineError,
    pipeline::{DateFilter, Pipeline, RunConfig, RunSummary},
    range::DEFAULT_DATE_FORMAT,
    schema::{Schema, SourceOptions},
    sink::SinkOptions,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_dedupe", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Probe(args) => handle_probe(&args),
        Commands::Clean(args) => handle_clean(&args),
        Commands::Inspect(args) => handle_inspect(&args),
    }
}

fn source_options(args: &SourceArgs, date_format: Option<&str>) -> Result<SourceOptions> {
    let label = args
        .encoding
        .as_deref()
        .unwrap_or(io_utils::DEFAULT_ENCODING_LABEL);
    let encoding = io_utils::resolve_encoding(Some(label)).map_err(|err| {
        PipelineError::Config(format!("{err:#}"))
    })?;
    let null_policy = if args.null_values.is_empty() {
        NullPolicy::default()
    } else {
        NullPolicy::new(args.null_values.iter().cloned())
    };
    debug!(
        "Null tokens: [{}]",
        itertools::join(null_policy.tokens().map(|t| format!("'{t}'")), ", ")
    );
    Ok(SourceOptions {
        separator: args.separator.unwrap_or(io_utils::DEFAULT_SEPARATOR),
        encoding,
        sample_rows: args.sample_rows,
        infer_types: !args.no_infer,
        date_format: date_format.map(str::to_string),
        null_policy,
    })
}

fn handle_probe(args: &ProbeArgs) -> Result<()> {
    let options = source_options(&args.source, args.date_format.as_deref())?;
    info!(
        "Probing '{}' with separator '{}' and encoding {}",
        args.source.input.display(),
        io_utils::printable_separator(options.separator),
        options.encoding.name()
    );
    let schema = schema::sniff(&args.source.input, &options)?;
    print!("{}", table::render_schema(&schema));
    if let Some(path) = &args.save {
        schema
            .save(path)
            .with_context(|| format!("Writing schema to {path:?}"))?;
        info!("Schema for {} column(s) written to {:?}", schema.columns.len(), path);
    }
    Ok(())
}

fn parse_bound(value: Option<&str>, flag: &str) -> Result<Option<NaiveDate>, PipelineError> {
    value
        .map(|text| {
            NaiveDate::parse_from_str(text.trim(), DEFAULT_DATE_FORMAT).map_err(|err| {
                PipelineError::Config(format!(
                    "{flag} '{text}' is not a date in YYYY-MM-DD form: {err}"
                ))
            })
        })
        .transpose()
}

fn run_config(args: &CleanArgs) -> Result<RunConfig, PipelineError> {
    let date_filter = match &args.date_column {
        Some(column) => Some(DateFilter {
            column: column.clone(),
            format: args
                .date_format
                .clone()
                .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string()),
            from: parse_bound(args.from.as_deref(), "--from")?,
            to: parse_bound(args.to.as_deref(), "--to")?,
        }),
        None => None,
    };
    let columns = args
        .columns
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if columns.is_empty() && !args.columns.is_empty() {
        return Err(PipelineError::Config(
            "--columns did not name any column".to_string(),
        ));
    }
    Ok(RunConfig {
        columns: (!columns.is_empty()).then_some(columns),
        date_filter,
        mode: args.decode_mode(),
        strategy: args.strategy.into(),
        preview_rows: args.preview,
        sink: SinkOptions {
            compression: args.compression.compression(),
            ..SinkOptions::default()
        },
        ..RunConfig::default()
    })
}

fn handle_clean(args: &CleanArgs) -> Result<()> {
    let options = source_options(&args.source, args.date_format.as_deref())?;
    let config = run_config(args)?;
    let pipeline = Pipeline::new(args.source.input.clone(), options);
    let sniffed = match &args.schema {
        Some(path) => {
            let schema = Schema::load(path)
                .map_err(|err| PipelineError::Schema(format!("{err:#}")))?;
            pipeline.with_schema(schema)?
        }
        None => pipeline.sniff()?,
    };
    let configured = sniffed.configure(config)?;
    let output_schema = configured.output_schema().clone();
    let summary = configured.run(&args.output)?;

    print_summary(&summary);
    if !summary.preview.is_empty() {
        println!();
        print!("{}", table::render_rows(&output_schema, &summary.preview));
    }
    if let Some(path) = &args.report {
        write_report(&summary, path)?;
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Rows read: {}", summary.total_rows_read);
    println!("Duplicates removed: {}", summary.duplicates_removed);
    println!("Rows written: {}", summary.rows_written);
    if summary.rows_skipped > 0 {
        println!("Rows skipped (strict): {}", summary.rows_skipped);
    }
    if summary.rows_out_of_range > 0 {
        println!("Rows outside date range: {}", summary.rows_out_of_range);
    }
    println!(
        "Artifact: {} ({} bytes)",
        summary.artifact.path.display(),
        summary.artifact.bytes
    );
}

fn write_report(summary: &RunSummary, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Creating report {path:?}"))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("Writing report {path:?}"))?;
    info!("Run summary written to {path:?}");
    Ok(())
}

fn handle_inspect(args: &InspectArgs) -> Result<()> {
    let (schema, rows) = sink::read_artifact(&args.input, Some(args.rows))
        .with_context(|| format!("Inspecting {:?}", args.input))?;
    print!("{}", table::render_schema(&schema));
    println!();
    print!("{}", table::render_rows(&schema, &rows));
    Ok(())
}
