use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use refdata_core::FilingRecord;

/// Reads the per-ticker filing cache JSON plus its modification time, used
/// to judge disk-tier freshness. Corrupt JSON deletes the file and returns
/// `None`, per §4.5.3 step 3.
pub fn read_filing_cache(path: &Path) -> Option<(Vec<FilingRecord>, DateTime<Utc>)> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified: SystemTime = metadata.modified().ok()?;
    let mtime: DateTime<Utc> = modified.into();

    let file = File::open(path).ok()?;
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(records) => Some((records, mtime)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt filing cache, deleting");
            let _ = std::fs::remove_file(path);
            None
        }
    }
}

pub fn write_filing_cache_atomic(path: &Path, records: &[FilingRecord]) {
    let parent = match path.parent() {
        Some(p) => p,
        None => return,
    };
    if let Err(e) = std::fs::create_dir_all(parent) {
        tracing::error!(path = %path.display(), error = %e, "failed to create filing cache directory");
        return;
    }

    let tmp = match tempfile::NamedTempFile::new_in(parent) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to create temp file for filing cache");
            return;
        }
    };

    if let Err(e) = serde_json::to_writer_pretty(&tmp, records) {
        tracing::error!(path = %path.display(), error = %e, "failed to serialize filing cache");
        return;
    }

    if let Err(e) = tmp.persist(path) {
        tracing::error!(path = %path.display(), error = %e, "failed to persist filing cache");
    }
}
