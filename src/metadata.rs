//! Reads what an entry handle knows about an item: its kind and, for
//! regular files in filesystem-aware containers, timestamps, size and
//! ownership.
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::driver::Entry;
use crate::driver::EntryKind;
use crate::error::DriverErrorKind;
use crate::error::Error;
use crate::error::Result;
use crate::handle_pool::EntryLease;
use crate::handle_pool::EntryPool;
use crate::locator::ItemId;

/// The metadata part of an evidence descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemMetadata {
    pub kind: EntryKind,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ItemMetadata {
    fn of_kind(kind: EntryKind) -> ItemMetadata {
        ItemMetadata {
            kind,
            modified: None,
            accessed: None,
            changed: None,
            created: None,
            size: None,
            uid: None,
            gid: None,
        }
    }
}

/// Converts seconds since the epoch; `None` if out of range.
fn to_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

/// Returns the metadata for `id`.
///
/// In fast mode, only classifies the entry as a file, a directory, or
/// unknown; an entry the container can't find is of kind `None`
/// rather than an error, so directory listings survive dangling
/// children.
///
/// The entry handle is always released before returning.
pub fn describe<P>(pool: &P, id: &ItemId, fast: bool) -> Result<ItemMetadata>
where
    P: EntryPool + ?Sized,
    P::Entry: Entry,
{
    if fast {
        let entry = match EntryLease::acquire(pool, id) {
            Ok(entry) => entry,
            Err(Error::Driver { source, .. }) if source.kind == DriverErrorKind::NotFound => {
                return Ok(ItemMetadata::of_kind(EntryKind::None))
            }
            Err(e) => return Err(e),
        };

        let kind = match entry.kind() {
            EntryKind::File => EntryKind::File,
            EntryKind::Directory => EntryKind::Directory,
            EntryKind::None => EntryKind::None,
            EntryKind::Link | EntryKind::Unknown => EntryKind::Unknown,
        };
        return Ok(ItemMetadata::of_kind(kind));
    }

    let entry = EntryLease::acquire(pool, id)?;
    let kind = entry.kind();
    if kind != EntryKind::File {
        return Ok(ItemMetadata::of_kind(kind));
    }

    Ok(match entry.metadata() {
        Some(meta) => ItemMetadata {
            kind: meta.kind.unwrap_or(EntryKind::None),
            modified: to_timestamp(meta.mtime),
            accessed: to_timestamp(meta.atime),
            changed: to_timestamp(meta.ctime),
            created: to_timestamp(meta.crtime),
            size: Some(meta.size),
            uid: Some(meta.uid),
            gid: Some(meta.gid),
        },
        None => ItemMetadata {
            size: entry.size(),
            ..ItemMetadata::of_kind(EntryKind::File)
        },
    })
}
