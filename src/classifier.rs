//! Change detection against the previous snapshot
//!
//! A source file is compared with the item at its equivalent path in the
//! previous complete snapshot. Only the modification time is consulted, at
//! whole-second resolution, so subsecond jitter between file systems never
//! forces a copy.

use crate::error::Result;
use crate::types::{ChangeKind, FileEntry};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::trace;

/// Classify a source file against `previous`, its equivalent path in the
/// previous snapshot
///
/// An item at `previous` that is not a regular file (a directory or a link
/// left where a file now lives) can't be shared and classifies as
/// [`ChangeKind::Modified`]. The check is read-only; I/O errors other than
/// a missing previous item are returned to the caller.
pub fn classify(entry: &FileEntry, previous: &Path) -> Result<ChangeKind> {
    let metadata = match fs::symlink_metadata(previous) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ChangeKind::New),
        Err(e) => return Err(e.into()),
    };

    let change = if !metadata.file_type().is_file() || metadata.mtime() != entry.modified_secs() {
        ChangeKind::Modified
    } else {
        ChangeKind::Unchanged
    };
    trace!("{:?} classified as {:?}", entry.path, change);
    Ok(change)
}

/// Classify a file given only its path
pub fn classify_path(source: &Path, previous: &Path) -> Result<ChangeKind> {
    let metadata = fs::symlink_metadata(source)?;
    classify(&FileEntry::from_metadata(source.to_path_buf(), &metadata), previous)
}
