//! An in-memory container.  Locators are `FAKE` path specs whose
//! `location` is an absolute slash-separated path; the root directory
//! `/` always exists and intermediate directories spring into
//! existence as files are added.
//!
//! The container counts every open and every live handle, and can be
//! told to fail the next few opens or reads, which is what the pool
//! and cache tests lean on.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use derivative::Derivative;

use crate::driver::Container;
use crate::driver::Entry;
use crate::driver::EntryKind;
use crate::driver::RawMetadata;
use crate::error::DriverError;
use crate::error::DriverErrorKind;
use crate::locator::ContainerType;
use crate::locator::ItemId;
use crate::locator::PathSpec;

#[derive(Clone, Debug)]
enum Node {
    File {
        data: Arc<[u8]>,
        meta: RawMetadata,
    },
    Directory {
        meta: RawMetadata,
    },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    entry_opens: HashMap<String, usize>,
    stream_opens: HashMap<String, usize>,
    open_failures: HashMap<String, u32>,
    read_failures: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    live_entries: AtomicUsize,
    live_streams: AtomicUsize,
    active_reads: AtomicUsize,
    overlapping_reads: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns the parent location of `location`, or `None` for the root.
fn parent_location(location: &str) -> Option<&str> {
    if location == "/" {
        return None;
    }

    match location.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn normalise(location: &str) -> String {
    let trimmed = location.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Cheap to clone; clones share the same tree and counters.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct MemoryContainer {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared>,
    rich_metadata: bool,
    open_delay: Duration,
    read_delay: Duration,
}

impl Default for MemoryContainer {
    fn default() -> Self {
        MemoryContainer::new()
    }
}

impl MemoryContainer {
    /// Returns a container with only an empty root directory.
    pub fn new() -> MemoryContainer {
        let shared = Arc::new(Shared::default());
        shared.lock().nodes.insert(
            "/".to_string(),
            Node::Directory {
                meta: RawMetadata {
                    kind: Some(EntryKind::Directory),
                    ..Default::default()
                },
            },
        );

        MemoryContainer {
            shared,
            rich_metadata: true,
            open_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
        }
    }

    /// Hides rich metadata: entries still know their kind and size,
    /// but `Entry::metadata` returns `None`.
    pub fn without_rich_metadata(mut self) -> MemoryContainer {
        self.rich_metadata = false;
        self
    }

    /// Makes every `open_entry` call sleep for `delay` first, to widen
    /// race windows.
    pub fn with_open_delay(mut self, delay: Duration) -> MemoryContainer {
        self.open_delay = delay;
        self
    }

    /// Makes every stream read sleep for `delay`, to widen race windows.
    pub fn with_read_delay(mut self, delay: Duration) -> MemoryContainer {
        self.read_delay = delay;
        self
    }

    /// Returns the identifier for `location` in this container.
    pub fn id(location: &str) -> ItemId {
        match ItemId::new(PathSpec::new(ContainerType::Fake, normalise(location))) {
            Ok(id) => id,
            // A spec with only an enum tag and a string always encodes.
            Err(e) => unreachable!("FAKE path spec failed to encode: {}", e),
        }
    }

    fn ensure_directories(state: &mut State, location: &str) {
        let mut current = parent_location(location);
        while let Some(dir) = current {
            state
                .nodes
                .entry(dir.to_string())
                .or_insert_with(|| Node::Directory {
                    meta: RawMetadata {
                        kind: Some(EntryKind::Directory),
                        ..Default::default()
                    },
                });
            current = parent_location(dir);
        }
    }

    /// Adds (or replaces) a regular file and returns its identifier.
    pub fn add_file(&self, location: &str, data: impl Into<Vec<u8>>) -> ItemId {
        let location = normalise(location);
        let data: Vec<u8> = data.into();
        let meta = RawMetadata {
            kind: Some(EntryKind::File),
            size: data.len() as u64,
            ..Default::default()
        };

        let mut state = self.shared.lock();
        MemoryContainer::ensure_directories(&mut state, &location);
        state.nodes.insert(
            location.clone(),
            Node::File {
                data: data.into(),
                meta,
            },
        );

        MemoryContainer::id(&location)
    }

    /// Adds an (empty) directory and returns its identifier.
    pub fn add_directory(&self, location: &str) -> ItemId {
        let location = normalise(location);
        let mut state = self.shared.lock();

        MemoryContainer::ensure_directories(&mut state, &location);
        state.nodes.entry(location.clone()).or_insert(Node::Directory {
            meta: RawMetadata {
                kind: Some(EntryKind::Directory),
                ..Default::default()
            },
        });

        MemoryContainer::id(&location)
    }

    /// Updates the rich metadata of an existing entry.  Returns false if
    /// there is no such entry.
    pub fn update_metadata(&self, location: &str, update: impl FnOnce(&mut RawMetadata)) -> bool {
        let mut state = self.shared.lock();

        match state.nodes.get_mut(&normalise(location)) {
            Some(Node::File { meta, .. }) | Some(Node::Directory { meta }) => {
                update(meta);
                true
            }
            None => false,
        }
    }

    /// Makes the next `count` opens of `location` fail transiently.
    pub fn fail_next_opens(&self, location: &str, count: u32) {
        self.shared
            .lock()
            .open_failures
            .insert(normalise(location), count);
    }

    /// Makes the next `count` stream reads of `location` fail.
    pub fn fail_next_reads(&self, location: &str, count: u32) {
        self.shared
            .lock()
            .read_failures
            .insert(normalise(location), count);
    }

    /// Number of times `open_entry` succeeded for `location`.
    pub fn entry_opens(&self, location: &str) -> usize {
        let state = self.shared.lock();
        state
            .entry_opens
            .get(&normalise(location))
            .copied()
            .unwrap_or(0)
    }

    /// Number of streams ever opened for `location`.
    pub fn stream_opens(&self, location: &str) -> usize {
        let state = self.shared.lock();
        state
            .stream_opens
            .get(&normalise(location))
            .copied()
            .unwrap_or(0)
    }

    /// Number of entry handles currently open (not yet dropped).
    pub fn live_entries(&self) -> usize {
        self.shared.live_entries.load(Ordering::SeqCst)
    }

    /// Number of streams currently open (not yet dropped).
    pub fn live_streams(&self) -> usize {
        self.shared.live_streams.load(Ordering::SeqCst)
    }

    /// Number of stream reads that started while another read, on any
    /// stream of this container, was still in progress.
    pub fn overlapping_reads(&self) -> usize {
        self.shared.overlapping_reads.load(Ordering::SeqCst)
    }
}

/// Consumes one pending injected failure for `location`, if any.
fn take_failure(failures: &mut HashMap<String, u32>, location: &str) -> bool {
    match failures.get_mut(location) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl Container for MemoryContainer {
    type Entry = MemoryEntry;

    fn open_entry(&self, id: &ItemId) -> Result<MemoryEntry, DriverError> {
        if id.container_type() != ContainerType::Fake {
            return Err(DriverError::new(
                DriverErrorKind::Unsupported,
                format!("{:?} locators are not served from memory", id.container_type()),
            ));
        }

        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }

        let location = normalise(id.location());
        let mut state = self.shared.lock();
        if take_failure(&mut state.open_failures, &location) {
            return Err(DriverError::transient(format!("injected failure for {}", location)));
        }

        let node = match state.nodes.get(&location) {
            Some(node) => node.clone(),
            None => return Err(DriverError::not_found(location)),
        };

        let prefix = if location == "/" {
            "/".to_string()
        } else {
            format!("{}/", location)
        };
        let children = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains('/'))
            .map(|(key, _)| MemoryContainer::id(key))
            .collect();

        *state.entry_opens.entry(location.clone()).or_insert(0) += 1;
        self.shared.live_entries.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryEntry {
            shared: self.shared.clone(),
            location,
            node,
            children,
            rich_metadata: self.rich_metadata,
            read_delay: self.read_delay,
        })
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MemoryEntry {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared>,
    location: String,
    #[derivative(Debug = "ignore")]
    node: Node,
    children: Vec<ItemId>,
    rich_metadata: bool,
    read_delay: Duration,
}

impl Drop for MemoryEntry {
    fn drop(&mut self) {
        self.shared.live_entries.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Entry for MemoryEntry {
    type Stream = MemoryStream;

    fn kind(&self) -> EntryKind {
        match &self.node {
            Node::File { .. } => EntryKind::File,
            Node::Directory { .. } => EntryKind::Directory,
        }
    }

    fn metadata(&self) -> Option<RawMetadata> {
        if !self.rich_metadata {
            return None;
        }

        match &self.node {
            Node::File { meta, .. } | Node::Directory { meta } => Some(*meta),
        }
    }

    fn size(&self) -> Option<u64> {
        match &self.node {
            Node::File { data, .. } => Some(data.len() as u64),
            Node::Directory { .. } => None,
        }
    }

    fn open_stream(&self) -> Result<MemoryStream, DriverError> {
        let data = match &self.node {
            Node::File { data, .. } => data.clone(),
            Node::Directory { .. } => {
                return Err(DriverError::new(
                    DriverErrorKind::Unsupported,
                    format!("{} is a directory", self.location),
                ))
            }
        };

        *self
            .shared
            .lock()
            .stream_opens
            .entry(self.location.clone())
            .or_insert(0) += 1;
        self.shared.live_streams.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryStream {
            shared: self.shared.clone(),
            location: self.location.clone(),
            cursor: Cursor::new(data),
            read_delay: self.read_delay,
        })
    }

    fn parent(&self) -> Option<ItemId> {
        parent_location(&self.location).map(MemoryContainer::id)
    }

    fn children(&self) -> Result<Vec<ItemId>, DriverError> {
        Ok(self.children.clone())
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MemoryStream {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared>,
    location: String,
    #[derivative(Debug = "ignore")]
    cursor: Cursor<Arc<[u8]>>,
    read_delay: Duration,
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.shared.live_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStream {
    fn read_inner(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if take_failure(&mut self.shared.lock().read_failures, &self.location) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected read failure for {}", self.location),
            ));
        }

        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }

        self.cursor.read(buf)
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.shared.active_reads.fetch_add(1, Ordering::SeqCst) > 0 {
            self.shared.overlapping_reads.fetch_add(1, Ordering::SeqCst);
        }

        let result = self.read_inner(buf);
        self.shared.active_reads.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

#[test]
fn test_tree_and_children() {
    let container = MemoryContainer::new();
    container.add_file("/docs/a.txt", b"a".to_vec());
    container.add_file("/docs/sub/b.txt", b"b".to_vec());
    container.add_file("/docs-other/c.txt", b"c".to_vec());

    let docs = container
        .open_entry(&MemoryContainer::id("/docs"))
        .expect("directory must open");
    assert_eq!(docs.kind(), EntryKind::Directory);
    assert_eq!(
        docs.children().expect("must list"),
        vec![
            MemoryContainer::id("/docs/a.txt"),
            MemoryContainer::id("/docs/sub")
        ]
    );
    assert_eq!(docs.parent(), Some(MemoryContainer::id("/")));

    let root = container
        .open_entry(&MemoryContainer::id("/"))
        .expect("root must open");
    assert_eq!(root.parent(), None);
    assert_eq!(root.children().expect("must list").len(), 2);
}

#[test]
fn test_counters_and_failures() {
    let container = MemoryContainer::new();
    let id = container.add_file("/a.bin", vec![1u8, 2, 3]);

    container.fail_next_opens("/a.bin", 1);
    assert!(matches!(container.open_entry(&id),
                     Err(e) if e.kind == DriverErrorKind::Transient));

    let entry = container.open_entry(&id).expect("second open must succeed");
    assert_eq!(container.entry_opens("/a.bin"), 1);
    assert_eq!(container.live_entries(), 1);

    let mut stream = entry.open_stream().expect("stream must open");
    assert_eq!(container.live_streams(), 1);

    container.fail_next_reads("/a.bin", 1);
    let mut dst = Vec::new();
    assert!(stream.read_to_end(&mut dst).is_err());
    stream.seek(SeekFrom::Start(0)).expect("seek must succeed");
    dst.clear();
    stream.read_to_end(&mut dst).expect("read must succeed");
    assert_eq!(dst, vec![1u8, 2, 3]);

    drop(stream);
    drop(entry);
    assert_eq!(container.live_streams(), 0);
    assert_eq!(container.live_entries(), 0);

    assert!(matches!(container.open_entry(&MemoryContainer::id("/missing")),
                     Err(e) if e.kind == DriverErrorKind::NotFound));
}

#[test]
fn test_overlapping_reads_are_counted() {
    use std::sync::Barrier;

    let container = MemoryContainer::new().with_read_delay(Duration::from_millis(20));
    let a = container.add_file("/a.bin", vec![1u8; 8]);
    let b = container.add_file("/b.bin", vec![2u8; 8]);
    let barrier = Barrier::new(2);

    // Two streams read at the same time, with nothing serialising them.
    std::thread::scope(|s| {
        for id in [&a, &b] {
            let container = &container;
            let barrier = &barrier;
            s.spawn(move || {
                let entry = container.open_entry(id).expect("entry must open");
                let mut stream = entry.open_stream().expect("stream must open");
                let mut buf = [0u8; 1];
                barrier.wait();
                for _ in 0..4 {
                    stream.read(&mut buf).expect("read must succeed");
                }
            });
        }
    });

    assert!(container.overlapping_reads() > 0);
}
