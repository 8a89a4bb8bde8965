//! Errors split into two families: failures that may go away if we
//! try again (a flaky container backend, a full object pool, an I/O
//! hiccup while copying) and failures that never will (a malformed
//! locator, a stream request for a directory, a double release).
//! Retry loops consult [`Error::is_transient`] so permanent failures
//! surface immediately instead of burning the whole attempt budget.
use crate::locator::ItemId;

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong inside a container driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The backend failed intermittently; the same call may succeed.
    Transient,
    /// The locator does not name anything in the container.
    NotFound,
    /// The container cannot perform this operation on this entry.
    Unsupported,
    /// Anything else; treated as permanent.
    Other,
}

/// Error reported by a [`crate::driver::Container`] implementation.
#[derive(thiserror::Error, Debug)]
#[error("{kind:?} container error: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> DriverError {
        DriverError {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> DriverError {
        DriverError::new(DriverErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> DriverError {
        DriverError::new(DriverErrorKind::NotFound, message)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to decode item locator: {0}")]
    InvalidLocator(String),
    #[error("failed to open {item}: {source}")]
    Driver {
        item: ItemId,
        #[source]
        source: DriverError,
    },
    #[error("cannot open a stream for {0}: it is not a regular file")]
    NotAFile(ItemId),
    #[error("released {0} without a matching acquire")]
    UntrackedRelease(ItemId),
    #[error("object pool is at capacity ({0} open streams)")]
    PoolExhausted(usize),
    #[error("{item} exceeds the maximum cacheable size of {limit} bytes")]
    TooLarge { item: ItemId, limit: u64 },
    #[error("copied {copied} bytes for {item}, expected {expected}")]
    Incomplete {
        item: ItemId,
        copied: u64,
        expected: u64,
    },
    #[error("there was an i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error while processing the image: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid string pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl Error {
    pub(crate) fn driver(item: &ItemId, source: DriverError) -> Error {
        Error::Driver {
            item: item.clone(),
            source,
        }
    }

    /// Returns whether retrying the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Driver { source, .. } => source.kind == DriverErrorKind::Transient,
            Error::PoolExhausted(_) | Error::Incomplete { .. } | Error::Io(_) => true,
            Error::InvalidLocator(_)
            | Error::NotAFile(_)
            | Error::UntrackedRelease(_)
            | Error::TooLarge { .. }
            | Error::Image(_)
            | Error::Json(_)
            | Error::Pattern(_) => false,
        }
    }
}

#[test]
fn test_transient_classification() {
    let item = ItemId::decode(r#"{"type_indicator":"OS","location":"/a"}"#)
        .expect("locator must decode");

    assert!(Error::driver(&item, DriverError::transient("flaky")).is_transient());
    assert!(!Error::driver(&item, DriverError::not_found("gone")).is_transient());
    assert!(Error::PoolExhausted(256).is_transient());
    assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_transient());

    assert!(!Error::InvalidLocator("garbage".into()).is_transient());
    assert!(!Error::NotAFile(item.clone()).is_transient());
    assert!(!Error::UntrackedRelease(item.clone()).is_transient());
    assert!(!Error::TooLarge { item, limit: 1 }.is_transient());
}
