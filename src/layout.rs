//! The cache root looks like
//!
//! ```text
//! <root>/files/<sha1 of locator>/<file name>
//! <root>/thumbnails/<sha1 of locator>/<file name>
//! <root>/.temp/
//! ```
//!
//! Each item gets its own shard directory, named after the digest of
//! its encoded locator, so items from different containers that share
//! a base name never collide.  Writers stage files in `.temp`, on the
//! same filesystem as the final paths, and publish them with a hard
//! link.
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::benign_error::is_absent_file_error;
use crate::locator::ItemId;

pub const FILES_SUBDIRECTORY: &str = "files";
pub const THUMBNAILS_SUBDIRECTORY: &str = "thumbnails";
pub const STAGING_SUBDIRECTORY: &str = ".temp";

/// Turns an item's base name into a safe single path component.
fn sanitize_file_name(name: &str) -> String {
    match name {
        "" | "." | ".." => "_".to_string(),
        name => name
            .chars()
            .map(|c| match c {
                '\0' | '/' | '\\' => '_',
                c => c,
            })
            .collect(),
    }
}

#[derive(Clone, Debug)]
pub struct CacheLayout {
    root: PathBuf,
    files: PathBuf,
    thumbnails: PathBuf,
    staging: PathBuf,
}

impl CacheLayout {
    /// Returns the layout rooted at `root`, without touching the
    /// filesystem.
    pub fn new(root: impl AsRef<Path>) -> CacheLayout {
        let root = root.as_ref().to_owned();

        CacheLayout {
            files: root.join(FILES_SUBDIRECTORY),
            thumbnails: root.join(THUMBNAILS_SUBDIRECTORY),
            staging: root.join(STAGING_SUBDIRECTORY),
            root,
        }
    }

    /// Creates the top-level directories, if they don't already exist.
    pub fn create_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.files)?;
        std::fs::create_dir_all(&self.thumbnails)?;
        std::fs::create_dir_all(&self.staging)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    pub fn cache_dir(&self, id: &ItemId) -> PathBuf {
        self.files.join(id.digest())
    }

    pub fn cache_path(&self, id: &ItemId) -> PathBuf {
        self.cache_dir(id).join(sanitize_file_name(id.file_name()))
    }

    pub fn thumbnail_dir(&self, id: &ItemId) -> PathBuf {
        self.thumbnails.join(id.digest())
    }

    pub fn thumbnail_path(&self, id: &ItemId) -> PathBuf {
        self.thumbnail_dir(id).join(sanitize_file_name(id.file_name()))
    }

    /// Returns a fresh staging file.  It is deleted on drop, unless
    /// published first.
    pub fn stage(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(".stage")
            .tempfile_in(&self.staging)
    }
}

/// Returns the length of the regular file at `path`, or `None` if there
/// is no such file.
pub fn file_len(path: &Path) -> Result<Option<u64>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if is_absent_file_error(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Returns whether `path` holds a complete copy of an item: a regular
/// file whose length matches `expected`, when the item's size is known.
pub fn is_complete_file(path: &Path, expected: Option<u64>) -> Result<bool> {
    Ok(matches!(file_len(path)?, Some(len) if expected.map_or(true, |size| size == len)))
}

#[cfg(test)]
mod test {
    use crate::layout::*;
    use crate::locator::ContainerType;
    use crate::locator::PathSpec;

    fn item(location: &str) -> ItemId {
        ItemId::new(PathSpec::new(ContainerType::Tsk, location).with_inode(12))
            .expect("locator must encode")
    }

    #[test]
    fn test_paths() {
        let layout = CacheLayout::new("/cache");
        let id = item("/Users/alice/photo.JPG");

        let dir = layout.cache_dir(&id);
        assert_eq!(dir, Path::new("/cache/files").join(id.digest()));
        assert_eq!(layout.cache_path(&id), dir.join("photo.JPG"));
        assert_eq!(
            layout.thumbnail_path(&id),
            Path::new("/cache/thumbnails")
                .join(id.digest())
                .join("photo.JPG")
        );
    }

    // Same base name, different items: different shards.
    #[test]
    fn test_no_collisions() {
        let layout = CacheLayout::new("/cache");
        let a = item("/a/report.doc");
        let b = item("/b/report.doc");

        assert_ne!(layout.cache_path(&a), layout.cache_path(&b));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_file_name(""), "_");
        assert_eq!(sanitize_file_name(".."), "_");
        assert_eq!(sanitize_file_name("a\\b\0c"), "a_b_c");
        assert_eq!(sanitize_file_name(".bashrc"), ".bashrc");
    }

    #[test]
    fn test_stage_and_file_len() {
        use std::io::Write;
        use test_dir::{DirBuilder, FileType, TestDir};

        let temp = TestDir::temp().create("dir", FileType::Dir);
        let layout = CacheLayout::new(temp.path("root"));
        layout.create_directories().expect("mkdir must succeed");
        // Idempotent.
        layout.create_directories().expect("mkdir must succeed");

        let mut staged = layout.stage().expect("stage must succeed");
        staged.write_all(b"1234").expect("write must succeed");
        assert!(staged.path().starts_with(layout.staging_dir()));
        assert_eq!(file_len(staged.path()).expect("stat must succeed"), Some(4));

        assert_eq!(file_len(&temp.path("missing")).expect("stat must succeed"), None);
        assert_eq!(file_len(&temp.path("dir")).expect("stat must succeed"), None);
    }

    #[test]
    fn test_is_complete_file() {
        use test_dir::{DirBuilder, FileType, TestDir};

        let temp = TestDir::temp()
            .create("four", FileType::ZeroFile(4))
            .create("dir", FileType::Dir);
        let four = temp.path("four");

        assert!(is_complete_file(&four, Some(4)).expect("stat must succeed"));
        // Unknown sizes trust any regular file.
        assert!(is_complete_file(&four, None).expect("stat must succeed"));
        assert!(!is_complete_file(&four, Some(26)).expect("stat must succeed"));
        assert!(!is_complete_file(&four, Some(3)).expect("stat must succeed"));

        assert!(!is_complete_file(&temp.path("missing"), None).expect("stat must succeed"));
        assert!(!is_complete_file(&temp.path("dir"), None).expect("stat must succeed"));
    }
}
