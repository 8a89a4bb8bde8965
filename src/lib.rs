//! `evidence-cache` manages the scarce resources of a forensic
//! evidence browser: open handles into evidence containers (disk
//! images, partitions, filesystems, archives), open byte streams on
//! the files inside them, and an on-disk cache of extracted copies and
//! image thumbnails.
//!
//! Opening an entry in a layered container is expensive (the whole
//! stack of image format, volume system and filesystem has to be
//! walked), and the number of streams a backend can keep open is
//! bounded.  The crate thus shares and reference counts both:
//!
//! - the [`HandlePool`] keeps at most one open entry handle per item,
//!   opening it on first use and closing it when the last user
//!   releases it;
//! - the [`ObjectPool`] does the same for byte streams, under a hard
//!   ceiling on open streams (256 by default).  Once full, it declines
//!   to open streams for new items rather than block or evict a stream
//!   someone is still reading.
//!
//! Items are named by [`ItemId`]s, decoded from a serialized locator
//! (a JSON path specification that nests container layers).  The
//! [`CacheManager`] turns an identifier into an [`EvidenceDescriptor`]:
//! the item's kind and metadata, the paths of its cached copy and
//! thumbnail, and its content type (sniffed from the cached bytes when
//! there is a cached copy, guessed from the extension otherwise).
//!
//! # Cache directory structure
//!
//! The cache root contains a `files` and a `thumbnails` directory, each
//! with one shard subdirectory per item, named by the SHA-1 of the
//! item's encoded locator.  Each shard holds a single file named after
//! the item's base name, so items that share a name in different
//! directories or containers never collide.  A `.temp` subdirectory
//! holds staged files.
//!
//! Cached copies are written once.  Writers copy the item to a staged
//! file, check that they got every byte, mark the file read-only with
//! the item's timestamps, and only then hard link it in place: a file
//! at its final path is always complete.  Staged files left behind by
//! crashed writers are deleted once they are an hour old.
//!
//! Writes are single-flight: while an item is being copied, other
//! requests for the same item wait for that copy instead of starting
//! their own.  By default, there is at most one cache write at a time
//! process-wide ([`SingleFlight::Global`]); [`SingleFlight::PerItem`]
//! lets different items be copied concurrently.
//!
//! # Locks
//!
//! The handle pool, the object pool, stream reads, cache writes and
//! the content classifier each have their own lock.  When both pool
//! locks are needed, the object pool's is taken first.  The handle
//! pool holds its lock across the backend's open call, which
//! serialises opens but guarantees that racing requests for one item
//! open it exactly once.  Stream reads are serialised process-wide:
//! container backends generally can't read two streams concurrently.
//!
//! # Sample usage
//!
//! ```no_run
//! use evidence_cache::CacheManager;
//! use evidence_cache::ConfigBuilder;
//! use evidence_cache::MemoryContainer;
//!
//! # fn main() -> evidence_cache::Result<()> {
//! let container = MemoryContainer::new();
//! let id = container.add_file("/Users/alice/notes.txt", b"meet at noon".to_vec());
//!
//! let config = ConfigBuilder::new("/tmp/evidence_cache", 16 << 20).build();
//! let manager = CacheManager::new(config, container)?;
//!
//! // Cache the item and sniff its type from the cached copy.
//! let desc = manager.describe(&id, true, false)?;
//! assert!(desc.is_cached);
//! assert_eq!(desc.content_type, "text/plain");
//! # Ok(())
//! # }
//! ```
mod benign_error;
pub mod classify;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod handle_pool;
pub mod layout;
pub mod locator;
pub mod manager;
pub mod memory;
pub mod metadata;
pub mod object_pool;
mod publish;
mod sweep;
pub mod thumbnail;
pub mod writer;

pub use classify::guess;
pub use classify::Classifier;
pub use classify::Sniffer;
pub use config::Config;
pub use config::ConfigBuilder;
pub use config::SingleFlight;
pub use descriptor::EvidenceDescriptor;
pub use driver::Container;
pub use driver::Entry;
pub use driver::EntryKind;
pub use driver::RawMetadata;
pub use error::DriverError;
pub use error::DriverErrorKind;
pub use error::Error;
pub use error::Result;
pub use handle_pool::HandlePool;
pub use locator::ContainerType;
pub use locator::ItemId;
pub use locator::PathSpec;
pub use manager::CacheManager;
pub use memory::MemoryContainer;
pub use object_pool::ObjectPool;
