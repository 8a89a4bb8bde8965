//! An [`EvidenceDescriptor`] is what the rest of the world sees of an
//! item: where it lives, what it is, where its cached copy and
//! thumbnail go, and what we know about its content type.  Descriptors
//! are snapshots; "updating" one returns a new descriptor.
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::classify;
use crate::driver::EntryKind;
use crate::layout;
use crate::layout::CacheLayout;
use crate::locator::ContainerType;
use crate::locator::ItemId;
use crate::metadata::ItemMetadata;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvidenceDescriptor {
    pub id: ItemId,
    pub path: String,
    pub file_name: String,
    pub extension: String,
    pub directory: String,
    pub container_type: ContainerType,
    pub inode: Option<u64>,

    pub kind: EntryKind,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,

    pub file_cache_path: PathBuf,
    pub file_cache_dir: PathBuf,
    pub thumbnail_cache_path: PathBuf,
    pub thumbnail_cache_dir: PathBuf,

    /// Sniffed from the content when `content_type_known`, otherwise
    /// guessed from the extension.
    pub content_type: String,
    pub content_type_known: bool,
    pub is_cached: bool,
}

impl EvidenceDescriptor {
    /// Assembles the descriptor for `id`, with a content type guessed
    /// from the extension and no cached copy.
    pub fn new(id: ItemId, metadata: ItemMetadata, layout: &CacheLayout) -> EvidenceDescriptor {
        let extension = id.extension();
        let content_type = classify::guess(&extension).to_string();

        EvidenceDescriptor {
            path: id.location().to_string(),
            file_name: id.file_name().to_string(),
            directory: id.directory().to_string(),
            container_type: id.container_type(),
            inode: id.inode(),
            extension,

            kind: metadata.kind,
            modified: metadata.modified,
            accessed: metadata.accessed,
            changed: metadata.changed,
            created: metadata.created,
            size: metadata.size,
            uid: metadata.uid,
            gid: metadata.gid,

            file_cache_path: layout.cache_path(&id),
            file_cache_dir: layout.cache_dir(&id),
            thumbnail_cache_path: layout.thumbnail_path(&id),
            thumbnail_cache_dir: layout.thumbnail_dir(&id),

            content_type,
            content_type_known: false,
            is_cached: false,
            id,
        }
    }

    pub fn with_content_type(self, content_type: impl Into<String>, known: bool) -> EvidenceDescriptor {
        EvidenceDescriptor {
            content_type: content_type.into(),
            content_type_known: known,
            ..self
        }
    }

    pub fn with_cached(self, is_cached: bool) -> EvidenceDescriptor {
        EvidenceDescriptor { is_cached, ..self }
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    /// Returns whether the cache path holds a complete copy of the
    /// item.  A file whose length differs from the item's known size is
    /// left over from an interrupted write and doesn't count.
    pub fn has_complete_copy(&self) -> bool {
        layout::is_complete_file(&self.file_cache_path, self.size).unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use crate::descriptor::*;
    use crate::locator::PathSpec;

    fn metadata(kind: EntryKind, size: Option<u64>) -> ItemMetadata {
        ItemMetadata {
            kind,
            modified: None,
            accessed: None,
            changed: None,
            created: None,
            size,
            uid: None,
            gid: None,
        }
    }

    #[test]
    fn test_new_descriptor() {
        let layout = CacheLayout::new("/cache");
        let id = ItemId::new(PathSpec::new(ContainerType::Tsk, "/Users/bob/Photo.JPG").with_inode(77))
            .expect("locator must encode");

        let desc = EvidenceDescriptor::new(id.clone(), metadata(EntryKind::File, Some(5)), &layout);
        assert_eq!(desc.path, "/Users/bob/Photo.JPG");
        assert_eq!(desc.file_name, "Photo.JPG");
        assert_eq!(desc.directory, "/Users/bob");
        assert_eq!(desc.extension, "jpg");
        assert_eq!(desc.inode, Some(77));
        assert_eq!(desc.container_type, ContainerType::Tsk);
        assert_eq!(desc.content_type, "image/jpeg");
        assert!(!desc.content_type_known);
        assert!(!desc.is_cached);
        assert!(desc.is_image());
        assert_eq!(desc.file_cache_path, layout.cache_path(&id));
        assert_eq!(desc.thumbnail_cache_dir, layout.thumbnail_dir(&id));
    }

    #[test]
    fn test_updates_are_copies() {
        let layout = CacheLayout::new("/cache");
        let id = ItemId::new(PathSpec::new(ContainerType::Os, "/tmp/blob"))
            .expect("locator must encode");

        let guessed = EvidenceDescriptor::new(id, metadata(EntryKind::File, None), &layout);
        assert_eq!(guessed.content_type, classify::UNKNOWN);

        let known = guessed
            .clone()
            .with_content_type("application/pdf", true)
            .with_cached(true);
        assert_eq!(known.content_type, "application/pdf");
        assert!(known.content_type_known && known.is_cached);
        assert_eq!(guessed.content_type, classify::UNKNOWN);
    }

    #[test]
    fn test_has_complete_copy() {
        use test_dir::{DirBuilder, TestDir};

        let temp = TestDir::temp();
        let layout = CacheLayout::new(temp.path("cache"));
        let id = ItemId::new(PathSpec::new(ContainerType::Os, "/tmp/doc.pdf"))
            .expect("locator must encode");
        let desc = EvidenceDescriptor::new(id, metadata(EntryKind::File, Some(26)), &layout);
        assert!(!desc.has_complete_copy());

        std::fs::create_dir_all(&desc.file_cache_dir).expect("mkdir must succeed");
        std::fs::write(&desc.file_cache_path, b"%PDF").expect("write must succeed");
        assert!(!desc.has_complete_copy());

        std::fs::write(&desc.file_cache_path, [b'x'; 26]).expect("write must succeed");
        assert!(desc.has_complete_copy());
    }

    #[test]
    fn test_serialize() {
        let layout = CacheLayout::new("/cache");
        let id = ItemId::new(PathSpec::new(ContainerType::Os, "/tmp/a.txt"))
            .expect("locator must encode");
        let desc = EvidenceDescriptor::new(id.clone(), metadata(EntryKind::Directory, None), &layout);

        let json = serde_json::to_value(&desc).expect("serialize must succeed");
        assert_eq!(json["id"], serde_json::Value::String(id.encoded().to_string()));
        assert_eq!(json["container_type"], "OS");
        assert_eq!(json["content_type"], "text/plain");
        assert_eq!(json["size"], serde_json::Value::Null);
    }
}
