use std::fs::{File, OpenOptions};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use csv::{Writer, WriterBuilder};

use crate::domain::OutcomeRow;
use crate::error::HarvestError;

/// Append-only CSV of per-record outcomes shared by every worker. Each append
/// takes the lock, writes one row and flushes before releasing it.
pub struct ResultLog {
    path: Utf8PathBuf,
    writer: Mutex<Writer<File>>,
}

impl ResultLog {
    /// Opens the log for appending, or truncates it when `append_if_exists`
    /// is false. The header goes in only if the file is empty at open time.
    pub fn open(path: &Utf8Path, append_if_exists: bool) -> Result<Self, HarvestError> {
        let open_error = |err: std::io::Error| HarvestError::LogOpen {
            path: path.to_path_buf(),
            message: err.to_string(),
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            std::fs::create_dir_all(parent.as_std_path()).map_err(open_error)?;
        }
        let mut options = OpenOptions::new();
        if append_if_exists {
            options.create(true).append(true);
        } else {
            options.create(true).write(true).truncate(true);
        }
        let file = options.open(path.as_std_path()).map_err(open_error)?;
        let is_empty = file.metadata().map_err(open_error)?.len() == 0;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if is_empty {
            writer
                .write_record(OutcomeRow::HEADER)
                .map_err(|err| HarvestError::LogWrite(err.to_string()))?;
            writer
                .flush()
                .map_err(|err| HarvestError::LogWrite(err.to_string()))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn append(&self, row: &OutcomeRow) -> Result<(), HarvestError> {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer
            .serialize(row)
            .map_err(|err| HarvestError::LogWrite(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| HarvestError::LogWrite(err.to_string()))
    }
}

/// Reads a result log back; used by tests and the summary printer.
pub fn read_rows(path: &Utf8Path) -> Result<Vec<OutcomeRow>, HarvestError> {
    let mut reader = csv::Reader::from_path(path.as_std_path()).map_err(|err| {
        HarvestError::LogOpen {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })?;
    reader
        .deserialize()
        .collect::<Result<Vec<OutcomeRow>, _>>()
        .map_err(|err| HarvestError::LogWrite(err.to_string()))
}
