//! The cache writer copies items out of their container into the
//! cache tree, once.
//!
//! Every copy runs inside a "flight": while an item is in flight, it
//! is in the caching set, and no other writer may copy it.  In
//! [`SingleFlight::Global`] mode, there is at most one flight at a
//! time, process-wide, so cache writes never compete for object-pool
//! slots; in [`SingleFlight::PerItem`] mode, different items are
//! copied concurrently.
//!
//! Copies go to a staging file and are published with a hard link
//! once complete, so a file at the final cache path is always whole.
//! Failed attempts are retried with a short randomised backoff, as
//! long as the failure is transient.
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use derivative::Derivative;
use rand::Rng;
use tracing::debug;
use tracing::warn;

use crate::classify::Classifier;
use crate::config::Config;
use crate::config::SingleFlight;
use crate::descriptor::EvidenceDescriptor;
use crate::driver::Container;
use crate::driver::EntryKind;
use crate::error::Error;
use crate::error::Result;
use crate::layout;
use crate::layout::CacheLayout;
use crate::locator::ItemId;
use crate::object_pool::ObjectPool;
use crate::object_pool::StreamLease;
use crate::publish;
use crate::sweep::SweepTrigger;
use crate::thumbnail::Thumbnailer;

/// Base of the randomised delay between two cache attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Flights {
    mode: SingleFlight,
    in_flight: Mutex<HashSet<ItemId>>,
    landed: Condvar,
}

/// Proof that the current thread may copy `id`.  Dropping it takes
/// `id` out of the caching set.
struct Flight<'a> {
    flights: &'a Flights,
    id: ItemId,
}

impl Flights {
    fn new(mode: SingleFlight) -> Flights {
        Flights {
            mode,
            in_flight: Mutex::new(HashSet::new()),
            landed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ItemId>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until `id` may take off, then adds it to the caching set.
    fn enter(&self, id: &ItemId) -> Flight<'_> {
        let mut in_flight = self.lock();
        while match self.mode {
            SingleFlight::Global => !in_flight.is_empty(),
            SingleFlight::PerItem => in_flight.contains(id),
        } {
            in_flight = self
                .landed
                .wait(in_flight)
                .unwrap_or_else(|e| e.into_inner());
        }

        in_flight.insert(id.clone());
        Flight {
            flights: self,
            id: id.clone(),
        }
    }

    fn contains(&self, id: &ItemId) -> bool {
        self.lock().contains(id)
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.flights.lock().remove(&self.id);
        self.flights.landed.notify_all();
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct CacheWriter<C: Container> {
    #[derivative(Debug = "ignore")]
    streams: Arc<ObjectPool<C>>,
    layout: CacheLayout,
    classifier: Arc<Classifier>,
    thumbnailer: Thumbnailer,
    flights: Flights,
    sweep: SweepTrigger,
    max_file_size: u64,
    attempts: u32,
    chunk_size: usize,
}

impl<C: Container> CacheWriter<C> {
    pub fn new(
        config: &Config,
        streams: Arc<ObjectPool<C>>,
        classifier: Arc<Classifier>,
    ) -> CacheWriter<C> {
        let layout = CacheLayout::new(&config.output_root);

        CacheWriter {
            streams,
            thumbnailer: Thumbnailer::new(layout.clone(), config.thumbnail_size),
            layout,
            classifier,
            flights: Flights::new(config.single_flight),
            sweep: SweepTrigger::new(config.staging_sweep_period),
            max_file_size: config.max_file_size,
            attempts: config.cache_attempts.max(1),
            chunk_size: config.chunk_size,
        }
    }

    pub fn thumbnailer(&self) -> &Thumbnailer {
        &self.thumbnailer
    }

    /// Returns whether `id` is being copied into the cache right now.
    pub fn is_caching(&self, id: &ItemId) -> bool {
        self.flights.contains(id)
    }

    /// Makes sure `desc` has a complete cached copy (and, for images, a
    /// thumbnail).  Returns false if the item can't be cached (not a
    /// regular file, or too large), or if every attempt failed.
    pub fn ensure_cached(&self, desc: &EvidenceDescriptor) -> bool {
        self.cache(desc).is_some()
    }

    /// Like [`CacheWriter::ensure_cached`], but returns the updated
    /// descriptor: cached, and with a content type sniffed from the
    /// cached copy.
    pub fn cache(&self, desc: &EvidenceDescriptor) -> Option<EvidenceDescriptor> {
        if desc.kind != EntryKind::File {
            return None;
        }

        if matches!(desc.size, Some(size) if size > self.max_file_size) {
            debug!(item = %desc.id, size = ?desc.size, limit = self.max_file_size, "item too large to cache");
            return None;
        }

        if let Err(e) = std::fs::create_dir_all(&desc.file_cache_dir) {
            warn!(item = %desc.id, error = %e, "failed to create cache directory");
            return None;
        }

        if !self.fill(desc) {
            return None;
        }

        let mut desc = desc.clone().with_cached(true);
        if !desc.content_type_known {
            match self.classifier.classify_path(&desc.file_cache_path) {
                Ok(content_type) => desc = desc.with_content_type(content_type, true),
                Err(e) => warn!(item = %desc.id, error = %e, "failed to classify cached copy"),
            }
        }

        self.thumbnailer.ensure_thumbnail(&*self.streams, &desc);
        Some(desc)
    }

    /// Returns whether the cache file for `desc` is complete, i.e.,
    /// exists and matches the item's size, if known.  Removes files of
    /// the wrong size.
    fn check_cached(&self, desc: &EvidenceDescriptor) -> Result<bool> {
        let path = &desc.file_cache_path;
        match layout::file_len(path)? {
            None => Ok(false),
            Some(len) if desc.size.map_or(true, |size| size == len) => Ok(true),
            Some(len) => {
                warn!(item = %desc.id, expected = ?desc.size, found = len, "removing incomplete cache file");
                publish::ensure_file_removed(path)?;
                Ok(false)
            }
        }
    }

    /// Runs the retry loop; returns whether the cache file is complete.
    fn fill(&self, desc: &EvidenceDescriptor) -> bool {
        let id = &desc.id;

        // Fast path: no flight, and no container I/O, for cache hits.
        if desc.has_complete_copy() {
            return true;
        }

        for attempt in 1..=self.attempts {
            let result = {
                let _flight = self.flights.enter(id);
                // Someone else may have finished while we waited.
                match self.check_cached(desc) {
                    Ok(true) => return true,
                    Ok(false) => self.copy(desc),
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    self.sweep.maybe_sweep(self.layout.staging_dir());
                    return true;
                }
                Err(e) if !e.is_transient() => {
                    warn!(item = %id, attempt, error = %e, "failed to cache item, giving up");
                    return false;
                }
                Err(e) => {
                    let remaining = self.attempts - attempt;
                    warn!(item = %id, attempt, remaining, error = %e, "failed to cache item");
                    if remaining > 0 {
                        let cap = RETRY_BACKOFF * attempt;
                        std::thread::sleep(cap.mul_f64(rand::thread_rng().gen_range(0.5..=1.0)));
                    }
                }
            }
        }

        false
    }

    /// Copies the item to a staging file and publishes it.
    fn copy(&self, desc: &EvidenceDescriptor) -> Result<()> {
        let id = &desc.id;
        let lease = StreamLease::require(&*self.streams, id, self.streams.max_open())?;
        let mut staged = self.layout.stage()?;

        let copied = lease.copy_to(staged.as_file_mut(), self.chunk_size, Some(self.max_file_size))?;
        lease.release()?;

        if copied > self.max_file_size {
            return Err(Error::TooLarge {
                item: id.clone(),
                limit: self.max_file_size,
            });
        }

        if let Some(expected) = desc.size {
            if copied != expected {
                return Err(Error::Incomplete {
                    item: id.clone(),
                    copied,
                    expected,
                });
            }
        }

        staged.as_file().sync_all()?;
        publish::publish(staged, &desc.file_cache_path, desc.modified, desc.accessed)?;
        debug!(item = %id, bytes = copied, "cached item");
        Ok(())
    }
}
