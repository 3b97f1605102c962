use std::fs::File;
use std::io::Read;

use camino::Utf8Path;
use csv::{ByteRecord, ReaderBuilder};
use tracing::{debug, warn};

use crate::config::ColumnNames;
use crate::domain::Record;
use crate::error::HarvestError;

/// Reads the whole input table into memory. Rows keep their zero-based data
/// row index as `position`.
pub fn read_records(
    path: &Utf8Path,
    columns: &ColumnNames,
    limit: Option<usize>,
) -> Result<Vec<Record>, HarvestError> {
    let file = File::open(path.as_std_path()).map_err(|err| HarvestError::InputRead {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let records = parse_records(file, columns, limit).map_err(|err| match err {
        HarvestError::InputRead { message, .. } => HarvestError::InputRead {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })?;
    debug!(path = %path, count = records.len(), "input table loaded");
    Ok(records)
}

pub fn parse_records<R: Read>(
    reader: R,
    columns: &ColumnNames,
    limit: Option<usize>,
) -> Result<Vec<Record>, HarvestError> {
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.byte_headers().map_err(input_error)?.clone();
    let header_names = headers.iter().map(decode_field).collect::<Vec<_>>();

    let id_idx = column_index(&header_names, &columns.id)
        .ok_or_else(|| HarvestError::MissingColumn(columns.id.clone()))?;
    let doi_idx = column_index(&header_names, &columns.doi);
    let url_idx = column_index(&header_names, &columns.url);
    if doi_idx.is_none() && url_idx.is_none() {
        return Err(HarvestError::MissingColumn(format!(
            "{} or {}",
            columns.doi, columns.url
        )));
    }

    let mut records = Vec::new();
    let mut row = ByteRecord::new();
    let mut position = 0usize;
    loop {
        if limit.map(|max| position >= max).unwrap_or(false) {
            break;
        }
        match reader.read_byte_record(&mut row) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                // Keep the slot so later rows stay in the same shard.
                warn!(position, error = %err, "unreadable input row");
                records.push(Record::new("", None, None, position));
                position += 1;
                continue;
            }
        }
        let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i)).map(decode_field);
        records.push(Record::new(
            cell(Some(id_idx)).unwrap_or_default(),
            cell(doi_idx),
            cell(url_idx),
            position,
        ));
        position += 1;
    }
    Ok(records)
}

fn column_index(headers: &[String], name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().trim_start_matches('\u{feff}') == name)
}

/// UTF-8 when valid, Latin-1 otherwise.
fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(value) => value.to_string(),
        Err(_) => bytes.iter().map(|&byte| byte as char).collect(),
    }
}

fn input_error(err: csv::Error) -> HarvestError {
    HarvestError::InputRead {
        path: Default::default(),
        message: err.to_string(),
    }
}
