//! Staged files become cache files in one step: the staged file is
//! made read-only and then hard-linked to its final path, which then
//! gets the evidence item's timestamps.  Readers thus either see no
//! file, or a complete one.  If another writer won the race, its file
//! stays and ours is dropped with the staging file.
use std::io::Result;
use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::benign_error::is_absent_file_error;
use crate::benign_error::is_already_published_error;

/// Removes a file if it exists.
pub fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// Marks the file at `path` as read-only.
fn set_read_only(path: &Path) -> Result<()> {
    let mut permissions = std::fs::symlink_metadata(path)?.permissions();

    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
}

/// Copies the evidence item's modification and access times to the
/// file at `path`.  Missing times leave the file's own time in place.
fn set_item_times(
    path: &Path,
    modified: Option<DateTime<Utc>>,
    accessed: Option<DateTime<Utc>>,
) -> Result<()> {
    let to_filetime = |time: DateTime<Utc>| {
        FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos())
    };

    match (modified.map(to_filetime), accessed.map(to_filetime)) {
        (None, None) => Ok(()),
        (Some(mtime), Some(atime)) => filetime::set_file_times(path, atime, mtime),
        (Some(mtime), None) => filetime::set_file_mtime(path, mtime),
        (None, Some(atime)) => filetime::set_file_atime(path, atime),
    }
}

/// Publishes the staged file as `to`, unless `to` already exists.
/// Returns whether this call created `to`.
///
/// The staged file is always consumed.  The caller is responsible for
/// syncing its contents first, if it cares.
pub fn publish(
    staged: NamedTempFile,
    to: &Path,
    modified: Option<DateTime<Utc>>,
    accessed: Option<DateTime<Utc>>,
) -> Result<bool> {
    let from = staged.path();

    set_read_only(from)?;
    let published = match std::fs::hard_link(from, to) {
        Ok(()) => true,
        Err(e) if is_already_published_error(&e) => false,
        Err(e) => return Err(e),
    };

    staged.close()?;
    // Staged files keep a fresh mtime until they're gone; only the
    // published name gets the item's times.
    if published {
        set_item_times(to, modified, accessed)?;
    }

    Ok(published)
}
