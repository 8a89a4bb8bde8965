//! The handle pool keeps at most one open entry handle per item, and
//! reference counts it: the first `acquire` opens the entry, later
//! ones share it, and the `release` that brings the count back to
//! zero closes it.
//!
//! The pool lock is held across the underlying open.  That
//! serialises *all* opens (even for unrelated items) behind one slow
//! backend call, but it is the only way to guarantee that two racing
//! `acquire`s for the same item never both reach the backend without
//! an extra per-item state machine.  Closing happens after the lock is
//! released.
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use derivative::Derivative;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::driver::Container;
use crate::error::DriverErrorKind;
use crate::error::Error;
use crate::error::Result;
use crate::locator::ItemId;

/// Default number of attempts at opening an entry when the backend
/// reports transient failures.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;

/// Reference-counted access to entry handles.
pub trait EntryPool: Send + Sync {
    type Entry;

    /// Returns the shared handle for `id`, opening it if necessary, and
    /// increments its reference count.
    fn acquire(&self, id: &ItemId) -> Result<Arc<Self::Entry>>;

    /// Decrements the reference count for `id`, and closes the handle
    /// when the count reaches zero.
    ///
    /// Fails with [`Error::UntrackedRelease`] if `id` holds no reference.
    fn release(&self, id: &ItemId) -> Result<()>;
}

struct EntrySlot<E> {
    entry: Arc<E>,
    refs: usize,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct HandlePool<C: Container> {
    #[derivative(Debug = "ignore")]
    container: Arc<C>,
    open_attempts: u32,
    #[derivative(Debug = "ignore")]
    slots: Mutex<HashMap<ItemId, EntrySlot<C::Entry>>>,
}

impl<C: Container> HandlePool<C> {
    /// Returns an empty pool over `container` that tries to open each
    /// entry up to `open_attempts` times.
    pub fn new(container: Arc<C>, open_attempts: u32) -> HandlePool<C> {
        HandlePool {
            container,
            open_attempts: open_attempts.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn container(&self) -> &Arc<C> {
        &self.container
    }

    // A panic while holding the lock can't leave a slot half-updated:
    // each critical section is a single insert, remove or increment.
    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, EntrySlot<C::Entry>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens `id`, retrying transient backend failures.
    fn open(&self, id: &ItemId) -> Result<C::Entry> {
        let mut attempt = 1;
        loop {
            match self.container.open_entry(id) {
                Ok(entry) => return Ok(entry),
                Err(e) if e.kind == DriverErrorKind::Transient && attempt < self.open_attempts => {
                    warn!(item = %id, attempt, error = %e, "transient error while opening evidence entry, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    error!(item = %id, attempt, error = %e, "failed to open evidence entry");
                    return Err(Error::driver(id, e));
                }
            }
        }
    }

    /// Returns the current reference count for `id`; zero means the
    /// handle is closed.
    pub fn refs(&self, id: &ItemId) -> usize {
        self.lock().get(id).map_or(0, |slot| slot.refs)
    }

    /// Returns the number of open handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires `id` and returns a guard that releases it on drop.
    pub fn lease(&self, id: &ItemId) -> Result<EntryLease<'_, Self>> {
        EntryLease::acquire(self, id)
    }
}

impl<C: Container> EntryPool for HandlePool<C> {
    type Entry = C::Entry;

    fn acquire(&self, id: &ItemId) -> Result<Arc<C::Entry>> {
        let mut slots = self.lock();

        if let Some(slot) = slots.get_mut(id) {
            slot.refs += 1;
            trace!(item = %id, refs = slot.refs, "entry handle hit");
            return Ok(slot.entry.clone());
        }

        let entry = Arc::new(self.open(id)?);
        slots.insert(
            id.clone(),
            EntrySlot {
                entry: entry.clone(),
                refs: 1,
            },
        );
        debug!(item = %id, open = slots.len(), "opened entry handle");
        Ok(entry)
    }

    fn release(&self, id: &ItemId) -> Result<()> {
        let closed = {
            let mut slots = self.lock();
            let slot = match slots.get_mut(id) {
                Some(slot) => slot,
                None => {
                    error!(item = %id, "attempted to close an already closed entry handle");
                    return Err(Error::UntrackedRelease(id.clone()));
                }
            };

            slot.refs -= 1;
            if slot.refs > 0 {
                return Ok(());
            }

            slots.remove(id)
        };

        // Drop the handle outside the critical section.
        drop(closed);
        debug!(item = %id, "closed entry handle");
        Ok(())
    }
}

/// Holds one reference to a pooled entry; releases it when dropped.
pub struct EntryLease<'a, P: EntryPool + ?Sized> {
    pool: &'a P,
    id: ItemId,
    entry: Option<Arc<P::Entry>>,
}

impl<'a, P: EntryPool + ?Sized> EntryLease<'a, P> {
    /// Acquires `id` from `pool`.
    pub fn acquire(pool: &'a P, id: &ItemId) -> Result<EntryLease<'a, P>> {
        let entry = pool.acquire(id)?;
        Ok(EntryLease {
            pool,
            id: id.clone(),
            entry: Some(entry),
        })
    }

    /// Releases the reference now, reporting any pooling error.
    pub fn release(mut self) -> Result<()> {
        self.entry = None;
        self.pool.release(&self.id)
    }
}

impl<'a, P: EntryPool + ?Sized> Deref for EntryLease<'a, P> {
    type Target = P::Entry;

    fn deref(&self) -> &P::Entry {
        match &self.entry {
            Some(entry) => entry,
            None => unreachable!("entry lease used after release"),
        }
    }
}

impl<'a, P: EntryPool + ?Sized> Drop for EntryLease<'a, P> {
    fn drop(&mut self) {
        if self.entry.take().is_some() {
            if let Err(e) = self.pool.release(&self.id) {
                error!(item = %self.id, error = %e, "failed to release entry lease");
            }
        }
    }
}
