//! Utility functions for Strata
//!
//! File operations shared by the backup engine and the snapshot lifecycle:
//! permission and ownership handling, timestamp copying, symlink helpers and
//! classification of I/O failures.
//!
//! ## Ownership
//!
//! Changing ownership needs privileges the process often lacks, so every
//! ownership helper here is best-effort: failures are logged and reported as
//! `false`, never as errors.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{copy_file_with_metadata, format_bytes};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = copy_file_with_metadata(Path::new("/etc/hosts"), Path::new("/tmp/hosts"))?;
//! println!("Copied {}", format_bytes(bytes));
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use filetime::FileTime;
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Get Unix permission bits from metadata
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

/// Set Unix permissions
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Try to set the owner and group of a path
///
/// `None` leaves the corresponding id unchanged. Returns `false` when the
/// change was refused.
pub fn try_set_ownership(path: &Path, uid: Option<u32>, gid: Option<u32>) -> bool {
    match chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw)) {
        Ok(()) => true,
        Err(e) => {
            warn!("Unable to set ownership for {:?}: {}", path, e);
            false
        }
    }
}

/// Copy user and group from `source` metadata onto `dest`, best-effort
pub fn copy_ownership(metadata: &fs::Metadata, dest: &Path) -> bool {
    match chown(
        dest,
        Some(Uid::from_raw(metadata.uid())),
        Some(Gid::from_raw(metadata.gid())),
    ) {
        Ok(()) => true,
        Err(e) => {
            // Only root may give files away
            warn!("Unable to copy ownership for {:?}: {}", dest, e);
            false
        }
    }
}

/// Apply the access and modification times from `metadata` to `dest`
pub fn copy_timestamps(metadata: &fs::Metadata, dest: &Path) -> Result<()> {
    let atime = FileTime::from_last_access_time(metadata);
    let mtime = FileTime::from_last_modification_time(metadata);
    filetime::set_file_times(dest, atime, mtime)?;
    Ok(())
}

/// Copy a regular file and then its ownership, permission bits and timestamps
///
/// Ownership is best-effort; everything else is reported as an error.
/// Returns the number of bytes copied.
pub fn copy_file_with_metadata(source: &Path, dest: &Path) -> Result<u64> {
    let metadata = fs::symlink_metadata(source)?;
    let bytes = fs::copy(source, dest)?;
    // chown clears setuid and setgid, so the mode has to come after it
    copy_ownership(&metadata, dest);
    set_permissions(dest, get_permissions(&metadata))?;
    copy_timestamps(&metadata, dest)?;
    trace!("Copied {:?} -> {:?} ({} bytes)", source, dest, bytes);
    Ok(bytes)
}

/// Check whether an I/O failure means the backup volume itself is unusable
///
/// A full volume, an exhausted quota or a read-only mount affects every
/// later write too, so these abort a run instead of skipping one item.
pub fn is_volume_failure(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(nix::libc::ENOSPC) | Some(nix::libc::EDQUOT) | Some(nix::libc::EROFS)
    )
}

/// Create a symlink
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Read symlink target
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Check whether anything, including a dangling symlink, exists at `path`
pub fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based).
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
