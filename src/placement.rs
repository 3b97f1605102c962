use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{info, warn};

use crate::domain::Record;
use crate::error::HarvestError;

pub const OUTPUT_EXTENSION: &str = "pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// The sharded file is already in place.
    AlreadyDone(Utf8PathBuf),
    /// A legacy flat-layout file was moved into its shard.
    Migrated(Utf8PathBuf),
    NeedsFetch(Utf8PathBuf),
}

/// Maps records onto `output_root/shard_<n>/<id>.pdf` and performs every
/// write into that tree.
#[derive(Debug, Clone)]
pub struct Placement {
    output_root: Utf8PathBuf,
    shard_size: usize,
}

impl Placement {
    pub fn new(output_root: Utf8PathBuf, shard_size: usize) -> Self {
        Self {
            output_root,
            shard_size: shard_size.max(1),
        }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn shard_index(&self, position: usize) -> usize {
        position / self.shard_size
    }

    pub fn shard_dir(&self, position: usize) -> Utf8PathBuf {
        self.output_root
            .join(format!("shard_{}", self.shard_index(position)))
    }

    pub fn file_name(id: &str) -> String {
        format!("{}.{OUTPUT_EXTENSION}", encode_file_stem(id))
    }

    pub fn final_path(&self, record: &Record) -> Utf8PathBuf {
        self.shard_dir(record.position).join(Self::file_name(&record.id))
    }

    pub fn legacy_path(&self, record: &Record) -> Utf8PathBuf {
        self.output_root.join(Self::file_name(&record.id))
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.output_root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("{}: {err}", self.output_root)))
    }

    /// Creates the shard directory, then decides whether the record still
    /// needs a download. A legacy flat file is migrated here.
    pub fn plan(&self, record: &Record) -> Result<Plan, HarvestError> {
        let shard_dir = self.shard_dir(record.position);
        fs::create_dir_all(shard_dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("{shard_dir}: {err}")))?;

        let final_path = self.final_path(record);
        if final_path.as_std_path().exists() {
            return Ok(Plan::AlreadyDone(final_path));
        }

        let legacy_path = self.legacy_path(record);
        if legacy_path.as_std_path().is_file() {
            match self.migrate_legacy(&legacy_path, &final_path) {
                Ok(()) => {
                    info!(id = %record.id, to = %final_path, "migrated legacy file");
                    return Ok(Plan::Migrated(final_path));
                }
                Err(err) => {
                    warn!(id = %record.id, error = %err, "legacy migration failed");
                }
            }
        }

        Ok(Plan::NeedsFetch(final_path))
    }

    pub fn migrate_legacy(
        &self,
        legacy_path: &Utf8Path,
        final_path: &Utf8Path,
    ) -> Result<(), HarvestError> {
        move_no_clobber(legacy_path.as_std_path(), final_path.as_std_path())
    }

    /// Moves a finished download into place. The destination is never
    /// written partially and never replaced.
    pub fn commit(&self, scratch_file: &Path, final_path: &Utf8Path) -> Result<(), HarvestError> {
        move_no_clobber(scratch_file, final_path.as_std_path())
    }
}

fn move_no_clobber(from: &Path, to: &Path) -> Result<(), HarvestError> {
    // hard_link fails if `to` exists, unlike rename on Unix.
    match fs::hard_link(from, to) {
        Ok(()) => fs::remove_file(from).map_err(|err| {
            HarvestError::Filesystem(format!("remove {}: {err}", from.display()))
        }),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(HarvestError::Filesystem(
            format!("{} already exists", to.display()),
        )),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported
            ) =>
        {
            copy_then_remove(from, to)
        }
        Err(err) => Err(HarvestError::Filesystem(format!(
            "move {} -> {}: {err}",
            from.display(),
            to.display()
        ))),
    }
}

/// Percent-encodes `%`, path separators, characters Windows rejects in file
/// names and control characters. Distinct identifiers always get distinct
/// file names.
pub fn encode_file_stem(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for ch in id.chars() {
        match ch {
            '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                encoded.push_str(&format!("%{:02X}", ch as u32));
            }
            ch if ch.is_control() => {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
            ch => encoded.push(ch),
        }
    }
    encoded
}

/// Cross-device fallback: the copy lands in a temp file next to the target
/// and is persisted with a no-clobber rename.
fn copy_then_remove(from: &Path, to: &Path) -> Result<(), HarvestError> {
    let parent = to
        .parent()
        .ok_or_else(|| HarvestError::Filesystem("invalid destination path".to_string()))?;
    let temp = Builder::new()
        .prefix(".paper-fetch")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    fs::copy(from, temp.path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist_noclobber(to)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    fs::remove_file(from).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}
