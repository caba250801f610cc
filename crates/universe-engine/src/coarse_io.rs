use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use refdata_core::CoarseRow;

/// Reads a coarse-universe CSV. Unlike factor/map files this format carries
/// a header row (§6), so rows are (de)serialized through `serde` rather than
/// hand-parsed.
pub fn read_coarse_file(path: &Path) -> Option<Vec<CoarseRow>> {
    let file = File::open(path).ok()?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));

    let mut rows = Vec::new();
    for record in reader.deserialize() {
        match record {
            Ok(row) => rows.push(row),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt coarse file row, discarding file");
                return None;
            }
        }
    }
    Some(rows)
}

pub fn write_coarse_file_atomic(path: &Path, rows: &[CoarseRow]) {
    let parent = match path.parent() {
        Some(p) => p,
        None => return,
    };
    if let Err(e) = std::fs::create_dir_all(parent) {
        tracing::error!(path = %path.display(), error = %e, "failed to create coarse file directory");
        return;
    }

    let tmp = match tempfile::NamedTempFile::new_in(parent) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to create temp file for coarse file");
            return;
        }
    };

    {
        let mut writer = csv::Writer::from_writer(&tmp);
        for row in rows {
            if let Err(e) = writer.serialize(row) {
                tracing::error!(path = %path.display(), error = %e, "failed to write coarse file row");
                return;
            }
        }
        if let Err(e) = writer.flush() {
            tracing::error!(path = %path.display(), error = %e, "failed to flush coarse file writer");
            return;
        }
    }

    if let Err(e) = tmp.persist(path) {
        tracing::error!(path = %path.display(), error = %e, "failed to persist coarse file");
    }
}
