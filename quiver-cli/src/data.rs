//! CSV input and JSON-lines output.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use quiver_core::{is_chronological, DataPoint, Series, Timestamp};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

const TIMESTAMP_COLUMN: &str = "timestamp";

/// Loads a CSV file with a `timestamp` column (RFC3339 or unix milliseconds).
/// Every other non-empty cell becomes a decimal field named after its column.
pub fn load_csv(path: &Path) -> Result<Series> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let timestamp_idx = headers
        .iter()
        .position(|name| name.eq_ignore_ascii_case(TIMESTAMP_COLUMN))
        .ok_or_else(|| anyhow!("{} has no `{TIMESTAMP_COLUMN}` column", path.display()))?;

    let mut series = Series::new();
    for (row, record) in reader.records().enumerate() {
        let line = row + 2;
        let record = record.with_context(|| format!("{}:{line}: unreadable row", path.display()))?;
        let raw_ts = record
            .get(timestamp_idx)
            .ok_or_else(|| anyhow!("{}:{line}: missing timestamp", path.display()))?;
        let mut point = DataPoint::new(
            parse_timestamp(raw_ts).with_context(|| format!("{}:{line}", path.display()))?,
        );
        for (idx, (name, cell)) in headers.iter().zip(record.iter()).enumerate() {
            if idx == timestamp_idx || cell.is_empty() {
                continue;
            }
            let value = parse_decimal(cell).with_context(|| {
                format!("{}:{line}: column `{name}` is not a number", path.display())
            })?;
            point.insert(name, value);
        }
        series.push(point);
    }

    if !is_chronological(&series) {
        warn!(path = %path.display(), "input rows are not in timestamp order");
    }
    info!(path = %path.display(), points = series.len(), "loaded dataset");
    Ok(series)
}

/// Parses RFC3339 text or integer unix milliseconds.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let millis: i64 = raw
        .parse()
        .map_err(|_| anyhow!("`{raw}` is neither RFC3339 nor unix milliseconds"))?;
    match Utc.timestamp_millis_opt(millis).single() {
        Some(timestamp) => Ok(timestamp),
        None => bail!("timestamp {millis} is out of range"),
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|err| anyhow!("{err}"))
}

/// Writes one JSON document per line to `path`, or stdout when `path` is
/// `None`.
pub fn write_json_lines<T: Serialize>(
    path: Option<&Path>,
    records: impl IntoIterator<Item = T>,
) -> Result<usize> {
    let mut writer: Box<dyn Write> = match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    let mut written = 0;
    for record in records {
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
