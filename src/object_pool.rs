//! The object pool shares open byte streams the way the handle pool
//! shares entry handles, with one difference: it never holds more than
//! `max_open` streams at once.  Once full, requests for items that
//! aren't already open get `Ok(None)`: the pool neither blocks nor
//! evicts a stream someone else is reading.  Callers treat `None` as
//! "temporarily unavailable" and degrade (skip caching, serve a
//! placeholder, or report [`Error::PoolExhausted`]).
//!
//! The backend's streaming API isn't safe for concurrent reads, even
//! on different streams, so every read must happen under the pool's
//! [`StreamPool::read_lock`].
use std::collections::HashMap;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use derivative::Derivative;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::driver::Container;
use crate::driver::Entry;
use crate::driver::EntryKind;
use crate::driver::StreamOf;
use crate::error::Error;
use crate::error::Result;
use crate::handle_pool::EntryPool;
use crate::handle_pool::HandlePool;
use crate::locator::ItemId;

/// Default ceiling on concurrently open streams.
pub const DEFAULT_MAX_OPEN_STREAMS: usize = 256;

/// A pooled stream.  Hold the pool's read lock before locking it.
pub type SharedStream<S> = Arc<Mutex<S>>;

/// Reference-counted, capacity-bounded access to byte streams.
pub trait StreamPool: Send + Sync {
    type Stream: Read + Seek + Send;

    /// Returns the shared stream for `id`, opening it if necessary, and
    /// increments its reference count.  Returns `Ok(None)`, without
    /// taking a reference, when `id` isn't open and the pool is full.
    fn acquire(&self, id: &ItemId) -> Result<Option<SharedStream<Self::Stream>>>;

    /// Decrements the reference count for `id`, and closes the stream
    /// when the count reaches zero.
    fn release(&self, id: &ItemId) -> Result<()>;

    /// Serialises reads across every stream in the pool.
    fn read_lock(&self) -> MutexGuard<'_, ()>;
}

struct StreamSlot<S> {
    stream: SharedStream<S>,
    refs: usize,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ObjectPool<C: Container> {
    handles: Arc<HandlePool<C>>,
    max_open: usize,
    #[derivative(Debug = "ignore")]
    slots: Mutex<HashMap<ItemId, StreamSlot<StreamOf<C>>>>,
    #[derivative(Debug = "ignore")]
    read_lock: Mutex<()>,
}

/// Opens a stream on `entry`, which must be a regular file.
fn open_stream<E: Entry>(id: &ItemId, entry: &E) -> Result<E::Stream> {
    if entry.kind() != EntryKind::File {
        return Err(Error::NotAFile(id.clone()));
    }

    entry.open_stream().map_err(|e| Error::driver(id, e))
}

impl<C: Container> ObjectPool<C> {
    /// Returns an empty pool that opens entries through `handles` and
    /// keeps at most `max_open` streams open.  The pool always admits
    /// at least one stream.
    pub fn new(handles: Arc<HandlePool<C>>, max_open: usize) -> ObjectPool<C> {
        ObjectPool {
            handles,
            max_open: max_open.max(1),
            slots: Mutex::new(HashMap::new()),
            read_lock: Mutex::new(()),
        }
    }

    pub fn handles(&self) -> &Arc<HandlePool<C>> {
        &self.handles
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, StreamSlot<StreamOf<C>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the current reference count for `id`.
    pub fn refs(&self, id: &ItemId) -> usize {
        self.lock().get(id).map_or(0, |slot| slot.refs)
    }

    /// Returns the number of open streams.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Like [`StreamPool::acquire`], but opens new streams from
    /// `entry`, when provided, instead of acquiring a handle from the
    /// handle pool.  The caller keeps ownership of `entry`'s reference.
    ///
    /// Fails with [`Error::NotAFile`] if the entry isn't a regular
    /// file; any handle this call acquired is released first.
    pub fn acquire_with(
        &self,
        id: &ItemId,
        entry: Option<&C::Entry>,
    ) -> Result<Option<SharedStream<StreamOf<C>>>> {
        // Lock order: object pool, then handle pool.
        let mut slots = self.lock();

        if let Some(slot) = slots.get_mut(id) {
            slot.refs += 1;
            trace!(item = %id, refs = slot.refs, "stream hit");
            return Ok(Some(slot.stream.clone()));
        }

        if slots.len() >= self.max_open {
            debug!(item = %id, max_open = self.max_open, "object pool full, declining to open stream");
            return Ok(None);
        }

        let stream = match entry {
            Some(entry) => open_stream(id, entry)?,
            None => {
                let entry = self.handles.acquire(id)?;
                let opened = open_stream(id, entry.as_ref());
                drop(entry);

                let released = self.handles.release(id);
                let stream = opened?;
                released?;
                stream
            }
        };

        let stream = Arc::new(Mutex::new(stream));
        slots.insert(
            id.clone(),
            StreamSlot {
                stream: stream.clone(),
                refs: 1,
            },
        );
        debug!(item = %id, open = slots.len(), "opened stream");
        Ok(Some(stream))
    }

    /// Acquires `id` and returns a guard that releases it on drop, or
    /// `None` if the pool is full.
    pub fn lease(&self, id: &ItemId) -> Result<Option<StreamLease<'_, Self>>> {
        StreamLease::acquire(self, id)
    }
}

impl<C: Container> StreamPool for ObjectPool<C> {
    type Stream = StreamOf<C>;

    fn acquire(&self, id: &ItemId) -> Result<Option<SharedStream<StreamOf<C>>>> {
        self.acquire_with(id, None)
    }

    fn release(&self, id: &ItemId) -> Result<()> {
        let mut slots = self.lock();
        let slot = match slots.get_mut(id) {
            Some(slot) => slot,
            None => {
                error!(item = %id, "attempted to close an already closed stream");
                return Err(Error::UntrackedRelease(id.clone()));
            }
        };

        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(());
        }

        // Close under the lock: the ceiling counts physical streams, so
        // a new one must not open before this one is gone.
        drop(slots.remove(id));
        debug!(item = %id, open = slots.len(), "closed stream");
        Ok(())
    }

    fn read_lock(&self) -> MutexGuard<'_, ()> {
        self.read_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds one reference to a pooled stream; releases it when dropped.
pub struct StreamLease<'a, P: StreamPool + ?Sized> {
    pool: &'a P,
    id: ItemId,
    stream: Option<SharedStream<P::Stream>>,
}

impl<'a, P: StreamPool + ?Sized> StreamLease<'a, P> {
    /// Acquires `id` from `pool`; `Ok(None)` if the pool is full.
    pub fn acquire(pool: &'a P, id: &ItemId) -> Result<Option<StreamLease<'a, P>>> {
        Ok(pool.acquire(id)?.map(|stream| StreamLease {
            pool,
            id: id.clone(),
            stream: Some(stream),
        }))
    }

    /// Acquires `id` from `pool`, and fails with
    /// [`Error::PoolExhausted`] if the pool is full.
    pub fn require(pool: &'a P, id: &ItemId, max_open: usize) -> Result<StreamLease<'a, P>> {
        StreamLease::acquire(pool, id)?.ok_or(Error::PoolExhausted(max_open))
    }

    /// Reads the whole stream from offset 0, under the pool's read
    /// lock, and rewinds it for the next reader.
    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.copy_to(&mut data, usize::MAX, None)?;
        Ok(data)
    }

    /// Copies the whole stream from offset 0 to `dst` in chunks of
    /// `chunk_size` bytes, under the pool's read lock, and rewinds the
    /// stream afterwards.  Gives up as soon as more than `limit` bytes
    /// have been copied, returning the count so far.
    pub fn copy_to(
        &self,
        dst: &mut impl std::io::Write,
        chunk_size: usize,
        limit: Option<u64>,
    ) -> Result<u64> {
        let _reading = self.pool.read_lock();
        let mut stream = self.stream().lock().unwrap_or_else(|e| e.into_inner());

        let copied = (|| -> std::io::Result<u64> {
            stream.seek(SeekFrom::Start(0))?;

            let mut buf = vec![0u8; chunk_size.clamp(1, 1 << 20)];
            let mut copied = 0u64;
            loop {
                let count = match stream.read(&mut buf) {
                    Ok(0) => return Ok(copied),
                    Ok(count) => count,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };

                dst.write_all(&buf[..count])?;
                copied += count as u64;
                if matches!(limit, Some(limit) if copied > limit) {
                    return Ok(copied);
                }
            }
        })();

        // Always leave the stream rewound for whoever shares it.
        let rewound = stream.seek(SeekFrom::Start(0));
        let copied = copied?;
        rewound?;
        Ok(copied)
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn stream(&self) -> &SharedStream<P::Stream> {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("stream lease used after release"),
        }
    }

    /// Releases the reference now, reporting any pooling error.
    pub fn release(mut self) -> Result<()> {
        self.stream = None;
        self.pool.release(&self.id)
    }
}

impl<'a, P: StreamPool + ?Sized> Drop for StreamLease<'a, P> {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            if let Err(e) = self.pool.release(&self.id) {
                error!(item = %self.id, error = %e, "failed to release stream lease");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::handle_pool::HandlePool;
    use crate::handle_pool::DEFAULT_OPEN_ATTEMPTS;
    use crate::memory::MemoryContainer;
    use crate::object_pool::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::time::Duration;

    fn pool(container: &MemoryContainer, max_open: usize) -> ObjectPool<MemoryContainer> {
        let handles = Arc::new(HandlePool::new(
            Arc::new(container.clone()),
            DEFAULT_OPEN_ATTEMPTS,
        ));
        ObjectPool::new(handles, max_open)
    }

    #[test]
    fn test_acquire_release() {
        let container = MemoryContainer::new();
        let id = container.add_file("/a.txt", b"hello".to_vec());
        let pool = pool(&container, 4);

        let stream = pool
            .acquire(&id)
            .expect("acquire must succeed")
            .expect("pool has room");
        assert_eq!(pool.refs(&id), 1);
        // The entry handle was only needed to open the stream.
        assert_eq!(pool.handles().refs(&id), 0);
        assert_eq!(container.live_entries(), 0);
        drop(stream);

        pool.release(&id).expect("release must succeed");
        assert_eq!(pool.refs(&id), 0);
        assert_eq!(container.live_streams(), 0);
        assert!(matches!(pool.release(&id), Err(Error::UntrackedRelease(_))));
    }

    #[test]
    fn test_shared_stream() {
        let container = MemoryContainer::new();
        let id = container.add_file("/a.txt", b"hello".to_vec());
        let pool = pool(&container, 4);

        let first = pool.acquire(&id).expect("must succeed").expect("room");
        let second = pool.acquire(&id).expect("must succeed").expect("room");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(container.stream_opens("/a.txt"), 1);
        assert_eq!(pool.refs(&id), 2);

        pool.release(&id).expect("must succeed");
        pool.release(&id).expect("must succeed");
        drop((first, second));
        assert_eq!(container.live_streams(), 0);
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let container = MemoryContainer::new();
        let dir = container.add_directory("/docs");
        let pool = pool(&container, 4);

        assert!(matches!(pool.acquire(&dir), Err(Error::NotAFile(_))));
        // The handle opened to check the kind was released again.
        assert_eq!(pool.handles().refs(&dir), 0);
        assert_eq!(container.live_entries(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_acquire_with_entry() {
        let container = MemoryContainer::new();
        let id = container.add_file("/a.txt", b"hello".to_vec());
        let pool = pool(&container, 4);

        let entry = pool.handles().lease(&id).expect("lease must succeed");
        pool.acquire_with(&id, Some(&*entry))
            .expect("must succeed")
            .expect("room");
        // The caller's handle reference is untouched.
        assert_eq!(pool.handles().refs(&id), 1);
        assert_eq!(container.entry_opens("/a.txt"), 1);

        drop(entry);
        pool.release(&id).expect("must succeed");
    }

    #[test]
    fn test_ceiling_declines_new_streams() {
        let container = MemoryContainer::new();
        let a = container.add_file("/a", b"a".to_vec());
        let b = container.add_file("/b", b"b".to_vec());
        let c = container.add_file("/c", b"c".to_vec());
        let pool = pool(&container, 2);

        pool.acquire(&a).expect("must succeed").expect("room");
        pool.acquire(&b).expect("must succeed").expect("room");

        // Full: a new item is declined without an error or a reference...
        assert!(pool.acquire(&c).expect("must succeed").is_none());
        assert_eq!(pool.refs(&c), 0);
        assert_eq!(container.stream_opens("/c"), 0);
        // ... but already open items are still shared.
        pool.acquire(&a).expect("must succeed").expect("already open");
        assert_eq!(pool.refs(&a), 2);

        pool.release(&b).expect("must succeed");
        pool.acquire(&c).expect("must succeed").expect("room again");
    }

    #[test]
    fn test_zero_ceiling_admits_one_stream() {
        let container = MemoryContainer::new();
        let a = container.add_file("/a", b"a".to_vec());
        let b = container.add_file("/b", b"b".to_vec());
        let pool = pool(&container, 0);
        assert_eq!(pool.max_open(), 1);

        let lease = pool.lease(&a).expect("must succeed").expect("room for one");
        assert_eq!(lease.read_to_end().expect("read"), b"a".to_vec());
        assert!(pool.lease(&b).expect("must succeed").is_none());
    }

    #[test]
    fn test_lease_reads_and_rewinds() {
        let container = MemoryContainer::new();
        let id = container.add_file("/a.txt", b"0123456789".to_vec());
        let pool = pool(&container, 4);

        let lease = pool.lease(&id).expect("must succeed").expect("room");
        assert_eq!(lease.read_to_end().expect("read"), b"0123456789".to_vec());
        // Rewound: a second full read sees everything again.
        assert_eq!(lease.read_to_end().expect("read"), b"0123456789".to_vec());

        let mut small = Vec::new();
        assert_eq!(lease.copy_to(&mut small, 3, Some(4)).expect("copy"), 6);
        assert_eq!(small, b"012345".to_vec());

        drop(lease);
        assert_eq!(pool.refs(&id), 0);
        assert_eq!(container.live_streams(), 0);
    }

    #[test]
    fn test_read_failure_rewinds_and_releases() {
        let container = MemoryContainer::new();
        let id = container.add_file("/a.txt", b"abc".to_vec());
        let pool = pool(&container, 4);

        container.fail_next_reads("/a.txt", 1);
        {
            let lease = pool.lease(&id).expect("must succeed").expect("room");
            assert!(matches!(lease.read_to_end(), Err(Error::Io(_))));
            assert_eq!(lease.read_to_end().expect("read"), b"abc".to_vec());
        }
        assert_eq!(pool.refs(&id), 0);
    }

    // Reads on different streams never overlap: every read, whichever
    // item it is for, happens under the pool's read lock.
    #[test]
    fn test_reads_are_serialised_across_streams() {
        let container = MemoryContainer::new().with_read_delay(Duration::from_millis(1));
        let ids = [
            container.add_file("/a.bin", vec![1u8; 64]),
            container.add_file("/b.bin", vec![2u8; 64]),
        ];
        let pool = pool(&container, 4);
        let barrier = Barrier::new(6);

        std::thread::scope(|s| {
            for worker in 0..6 {
                let id = &ids[worker % 2];
                let pool = &pool;
                let barrier = &barrier;
                s.spawn(move || {
                    let lease = pool.lease(id).expect("must succeed").expect("room");
                    barrier.wait();
                    for _ in 0..3 {
                        let mut dst = Vec::new();
                        assert_eq!(lease.copy_to(&mut dst, 16, None).expect("copy"), 64);
                    }
                });
            }
        });

        assert_eq!(container.overlapping_reads(), 0);
        assert!(pool.is_empty());
    }

    proptest! {
        // Random acquire/release traffic from several threads never
        // pushes the pool over its ceiling, and leaves nothing open.
        #[test]
        fn test_ceiling_under_concurrency(ops in proptest::collection::vec(0..12usize, 1..64),
                                          max_open in 1..6usize) {
            let container = MemoryContainer::new();
            let ids: Vec<_> = (0..12)
                .map(|i| container.add_file(&format!("/f{}", i), vec![i as u8; 16]))
                .collect();
            let pool = pool(&container, max_open);
            let barrier = Barrier::new(4);

            std::thread::scope(|s| {
                for worker in 0..4 {
                    let ops = &ops;
                    let ids = &ids;
                    let pool = &pool;
                    let barrier = &barrier;
                    let container = &container;
                    s.spawn(move || {
                        barrier.wait();
                        for op in ops.iter().skip(worker) {
                            let id = &ids[*op];
                            if pool.acquire(id).expect("acquire must not fail").is_some() {
                                assert!(container.live_streams() <= max_open);
                                pool.release(id).expect("release must succeed");
                            }
                        }
                    });
                }
            });

            prop_assert!(pool.is_empty());
            prop_assert_eq!(container.live_streams(), 0);
        }
    }
}
