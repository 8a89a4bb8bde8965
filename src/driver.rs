//! The container driver turns locators into open entries and byte
//! streams.  Everything about actual evidence formats (disk images,
//! partition tables, filesystems, archives) lives behind these
//! traits; the pools only care that opening is expensive and that the
//! resulting handles must be closed exactly once.
//!
//! Handles are closed by dropping them.
use std::io::Read;
use std::io::Seek;

use crate::error::DriverError;
use crate::locator::ItemId;

/// What an entry is, as far as the container can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Link,
    Unknown,
    /// The container has no type information for this entry.
    None,
}

/// Rich metadata, as exposed by filesystem-aware containers.  All
/// timestamps are seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawMetadata {
    /// `None` when the filesystem records no type for the entry.
    pub kind: Option<EntryKind>,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub crtime: i64,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

/// An open handle on one entry: type information and metadata,
/// without necessarily any access to the entry's bytes.
pub trait Entry: Send + Sync {
    type Stream: Read + Seek + Send;

    fn kind(&self) -> EntryKind;

    /// Returns rich metadata, if the container records any.
    fn metadata(&self) -> Option<RawMetadata>;

    /// Returns the size in bytes when the container knows it without
    /// rich metadata.
    fn size(&self) -> Option<u64> {
        self.metadata().map(|meta| meta.size)
    }

    /// Opens a fresh byte stream positioned at offset 0.
    fn open_stream(&self) -> Result<Self::Stream, DriverError>;

    /// Returns the identifier of the enclosing directory, if any.
    fn parent(&self) -> Option<ItemId>;

    /// Returns the identifiers of the directory's immediate children;
    /// empty for anything but directories.
    fn children(&self) -> Result<Vec<ItemId>, DriverError>;
}

/// Resolves locators to entries.
pub trait Container: Send + Sync {
    type Entry: Entry;

    /// Opens the entry named by `id`.  This is the expensive call the
    /// handle pool amortises.
    fn open_entry(&self, id: &ItemId) -> Result<Self::Entry, DriverError>;
}

/// The stream type produced by the entries of container `C`.
pub type StreamOf<C> = <<C as Container>::Entry as Entry>::Stream;
