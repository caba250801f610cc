use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDate;
use refdata_core::{MapFile, MapFileRow};

const DATE_FORMAT: &str = "%Y%m%d";

/// Reads a map file from disk. Any I/O or parse failure is treated as
/// disk-corruption (§7): logged, and the caller proceeds as if the file
/// were absent.
pub fn read_map_file(path: &Path) -> Option<MapFile> {
    let file = File::open(path).ok()?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(BufReader::new(file));

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt map file row, discarding file");
                return None;
            }
        };
        match parse_row(&record) {
            Some(row) => rows.push(row),
            None => {
                tracing::warn!(path = %path.display(), "unparseable map file row, discarding file");
                return None;
            }
        }
    }

    if rows.is_empty() {
        return None;
    }
    Some(MapFile { rows })
}

fn parse_row(record: &csv::StringRecord) -> Option<MapFileRow> {
    let date = NaiveDate::parse_from_str(record.get(0)?, DATE_FORMAT).ok()?;
    let ticker = record.get(1)?.to_string();
    let exchange = record.get(2)?.to_string();
    Some(MapFileRow { date, ticker, exchange })
}

/// Writes a map file atomically: temp file in the same directory, then
/// rename over the destination.
pub fn write_map_file_atomic(path: &Path, file: &MapFile) {
    let parent = match path.parent() {
        Some(p) => p,
        None => return,
    };
    if let Err(e) = std::fs::create_dir_all(parent) {
        tracing::error!(path = %path.display(), error = %e, "failed to create map file directory");
        return;
    }

    let tmp = match tempfile::NamedTempFile::new_in(parent) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to create temp file for map file");
            return;
        }
    };

    {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&tmp);
        for row in &file.rows {
            let record = [row.date.format(DATE_FORMAT).to_string(), row.ticker.clone(), row.exchange.clone()];
            if let Err(e) = writer.write_record(&record) {
                tracing::error!(path = %path.display(), error = %e, "failed to write map file row");
                return;
            }
        }
        if let Err(e) = writer.flush() {
            tracing::error!(path = %path.display(), error = %e, "failed to flush map file writer");
            return;
        }
    }

    if let Err(e) = tmp.persist(path) {
        tracing::error!(path = %path.display(), error = %e, "failed to persist map file");
    }
}
