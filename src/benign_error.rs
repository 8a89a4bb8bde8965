/// Some [`std::io::Error`]s are part of regular operations: cache
/// files and staged files come and go while other threads (or other
/// processes sharing the cache root) race with us.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're looking for
/// isn't on the server anymore, which is just as good as missing for a
/// cache: we'll write the file again.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        // `ErrorKind::StaleNetworkFileHandle` isn't stable yet.
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Checks whether the error means someone else already published the
/// file we were about to publish.
pub fn is_already_published_error(error: &Error) -> bool {
    error.kind() == ErrorKind::AlreadyExists
        || matches!(error.raw_os_error(), Some(errno) if errno == libc::EEXIST)
}

#[test]
fn test_absent_file() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));

    #[cfg(target_os = "linux")]
    assert!(is_absent_file_error(&Error::from_raw_os_error(116))); // ESTALE
}

#[test]
fn test_already_published() {
    assert!(is_already_published_error(&Error::from_raw_os_error(
        libc::EEXIST
    )));
    assert!(is_already_published_error(&Error::new(
        ErrorKind::AlreadyExists,
        "exists"
    )));
    assert!(!is_already_published_error(&Error::from_raw_os_error(
        libc::ENOENT
    )));
}
