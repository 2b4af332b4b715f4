//! Plain-text rendering of rows for the terminal.

use std::{borrow::Cow, fmt::Write as _};

use itertools::Itertools;

use crate::{
    data::{Row, Value},
    schema::Schema,
};

const NULL_MARKER: &str = "null";

pub fn render_rows(schema: &Schema, rows: &[Row]) -> String {
    let headers = schema.headers();
    let cells = rows
        .iter()
        .map(|row| row.iter().map(render_value).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    render_table(&headers, &cells)
}

/// Lists each column with its declared type, one per line.
pub fn render_schema(schema: &Schema) -> String {
    let headers = vec!["#".to_string(), "column".to_string(), "type".to_string()];
    let rows = schema
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let ty = match &column.date_format {
                Some(format) => format!("{} ({format})", column.datatype),
                None => column.datatype.to_string(),
            };
            vec![(idx + 1).to_string(), column.name.clone(), ty]
        })
        .collect::<Vec<_>>();
    render_table(&headers, &rows)
}

fn render_value(value: &Option<Value>) -> String {
    value
        .as_ref()
        .map(Value::as_display)
        .unwrap_or_else(|| NULL_MARKER.to_string())
}

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths = headers.iter().map(|h| display_width(h)).collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(display_width(cell));
        }
    }
    for width in &mut widths {
        *width = (*width).max(3);
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let line = values
        .iter()
        .zip(widths)
        .map(|(value, width)| {
            let cell = sanitize_cell(value);
            let padding = width.saturating_sub(display_width(&cell));
            format!("{cell}{}", " ".repeat(padding))
        })
        .join("  ");
    line.trim_end().to_string()
}

fn display_width(value: &str) -> usize {
    value.chars().count()
}

fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}
