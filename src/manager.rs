//! The [`CacheManager`] owns every piece of shared state (both pools,
//! the classifier, the cache writer) for one container and one cache
//! root.  Build one per process and share it by reference.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use derivative::Derivative;
use regex::bytes::Regex;
use tracing::debug;
use tracing::warn;

use crate::classify;
use crate::classify::Classifier;
use crate::config::Config;
use crate::descriptor::EvidenceDescriptor;
use crate::driver::Container;
use crate::driver::Entry;
use crate::driver::EntryKind;
use crate::error::Error;
use crate::error::Result;
use crate::handle_pool::HandlePool;
use crate::layout::CacheLayout;
use crate::locator::ItemId;
use crate::metadata;
use crate::object_pool::ObjectPool;
use crate::object_pool::StreamLease;
use crate::sweep;
use crate::writer::CacheWriter;

/// Default minimum length for [`CacheManager::strings`].
pub const DEFAULT_MIN_STRING_LENGTH: usize = 4;

/// Bytes that make up printable strings.
const STRING_CHARACTERS: &str = r"A-Za-z0-9/\-:.,_$%'()\[\]<> ";

#[derive(Derivative)]
#[derivative(Debug)]
pub struct CacheManager<C: Container> {
    config: Config,
    layout: CacheLayout,
    handles: Arc<HandlePool<C>>,
    streams: Arc<ObjectPool<C>>,
    classifier: Arc<Classifier>,
    writer: CacheWriter<C>,
}

impl<C: Container> CacheManager<C> {
    /// Returns a manager for `container`, with the default classifier.
    ///
    /// Creates the cache tree's top-level directories and deletes stale
    /// staging files left behind by earlier processes.
    pub fn new(config: Config, container: C) -> Result<CacheManager<C>> {
        CacheManager::with_classifier(config, container, Classifier::default())
    }

    pub fn with_classifier(
        config: Config,
        container: C,
        classifier: Classifier,
    ) -> Result<CacheManager<C>> {
        let layout = CacheLayout::new(&config.output_root);
        layout.create_directories()?;
        match sweep::sweep_stale_files(layout.staging_dir(), sweep::STALE_STAGING_AGE) {
            Ok(removed) => debug!(root = ?layout.root(), removed, "swept staging directory"),
            Err(e) => warn!(root = ?layout.root(), error = %e, "failed to sweep staging directory"),
        }

        let handles = Arc::new(HandlePool::new(Arc::new(container), config.open_attempts));
        let streams = Arc::new(ObjectPool::new(handles.clone(), config.max_open_streams));
        let classifier = Arc::new(classifier);
        let writer = CacheWriter::new(&config, streams.clone(), classifier.clone());

        Ok(CacheManager {
            config,
            layout,
            handles,
            streams,
            classifier,
            writer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handles(&self) -> &HandlePool<C> {
        &self.handles
    }

    pub fn streams(&self) -> &ObjectPool<C> {
        &self.streams
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Decodes `encoded`, then [`CacheManager::describe`]s it.
    pub fn describe_encoded(&self, encoded: &str, cache: bool, fast: bool) -> Result<EvidenceDescriptor> {
        self.describe(&ItemId::decode(encoded)?, cache, fast)
    }

    /// Returns the descriptor for `id`.
    ///
    /// With `cache`, first makes sure the item is in the cache.  The
    /// content type is sniffed from the cached copy when there is a
    /// complete one, and otherwise guessed from the extension.
    pub fn describe(&self, id: &ItemId, cache: bool, fast: bool) -> Result<EvidenceDescriptor> {
        let metadata = metadata::describe(&*self.handles, id, fast)?;
        let desc = EvidenceDescriptor::new(id.clone(), metadata, &self.layout);

        if cache {
            return Ok(self.writer.cache(&desc).unwrap_or(desc));
        }

        if self.writer.is_caching(id) || !desc.has_complete_copy() {
            return Ok(desc);
        }

        Ok(match self.classifier.classify_path(&desc.file_cache_path) {
            Ok(content_type) => desc.with_content_type(content_type, true).with_cached(true),
            Err(e) => {
                debug!(item = %id, error = %e, "failed to classify cached copy");
                desc
            }
        })
    }

    /// See [`CacheWriter::ensure_cached`].
    pub fn ensure_cached(&self, desc: &EvidenceDescriptor) -> bool {
        self.writer.ensure_cached(desc)
    }

    /// Makes sure an image item has a thumbnail; returns whether this
    /// call created it.
    pub fn ensure_thumbnail(&self, desc: &EvidenceDescriptor) -> bool {
        self.writer.thumbnailer().ensure_thumbnail(&*self.streams, desc)
    }

    /// Sniffs the content type of `id` from its bytes in the container.
    pub fn classify(&self, id: &ItemId) -> Result<String> {
        self.classifier
            .classify_item(&*self.streams, id, self.streams.max_open())
    }

    /// Guesses a content type from a file extension.
    pub fn guess(&self, extension: &str) -> &'static str {
        classify::guess(extension)
    }

    /// Reads the whole of `id`.  Fails with [`Error::PoolExhausted`]
    /// when the object pool is full.
    pub fn read_file(&self, id: &ItemId) -> Result<Vec<u8>> {
        let lease = StreamLease::require(&*self.streams, id, self.streams.max_open())?;
        lease.read_to_end()
    }

    /// Returns the runs of at least `min_len` printable characters in
    /// `id`'s bytes.
    pub fn strings(&self, id: &ItemId, min_len: usize) -> Result<Vec<String>> {
        let pattern = Regex::new(&format!("[{}]{{{},}}", STRING_CHARACTERS, min_len.max(1)))?;
        let data = self.read_file(id)?;

        Ok(pattern
            .find_iter(&data)
            .map(|found| String::from_utf8_lossy(found.as_bytes()).into_owned())
            .collect())
    }

    /// Returns fast descriptors for the children of `id` (and their
    /// descendants, with `recursive`).  `id` itself isn't listed.
    pub fn list_directory(&self, id: &ItemId, recursive: bool) -> Result<Vec<EvidenceDescriptor>> {
        let mut listing = Vec::new();
        self.list_into(id, recursive, &mut listing)?;
        Ok(listing)
    }

    fn list_into(&self, id: &ItemId, recursive: bool, listing: &mut Vec<EvidenceDescriptor>) -> Result<()> {
        let children = {
            let entry = self.handles.lease(id)?;
            if entry.kind() != EntryKind::Directory {
                return Ok(());
            }

            entry.children().map_err(|e| Error::driver(id, e))?
        };

        for child in children {
            let desc = self.describe(&child, false, true)?;
            let descend = recursive && desc.kind == EntryKind::Directory;
            listing.push(desc);
            if descend {
                self.list_into(&child, recursive, listing)?;
            }
        }

        Ok(())
    }

    /// Returns the identifier of the entry containing `id`, if any.
    pub fn parent(&self, id: &ItemId) -> Result<Option<ItemId>> {
        Ok(self.handles.lease(id)?.parent())
    }

    /// Returns whether `id` has a complete cached copy that no writer is
    /// working on.  Checking the copy's length against the item's size
    /// needs the item's metadata, so this opens the entry when there is
    /// a file to check.
    pub fn is_cached(&self, id: &ItemId) -> bool {
        if self.writer.is_caching(id) || !self.layout.cache_path(id).is_file() {
            return false;
        }

        match metadata::describe(&*self.handles, id, false) {
            Ok(metadata) => EvidenceDescriptor::new(id.clone(), metadata, &self.layout).has_complete_copy(),
            Err(e) => {
                debug!(item = %id, error = %e, "failed to check cached copy");
                false
            }
        }
    }

    pub fn cache_path(&self, id: &ItemId) -> PathBuf {
        self.layout.cache_path(id)
    }

    pub fn thumbnail_path(&self, id: &ItemId) -> PathBuf {
        self.layout.thumbnail_path(id)
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }
}
