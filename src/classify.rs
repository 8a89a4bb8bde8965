//! Content classification turns bytes into a MIME type string.
//!
//! Sniffers take `&mut self`: the classification libraries we wrap
//! keep per-handle scratch state and aren't reentrant, so a
//! [`Classifier`] owns exactly one sniffer behind its own mutex.  That
//! mutex is distinct from the pool locks, and we never hold a pool or
//! stream lock while sniffing.
//!
//! [`guess`] is the lock-free fallback: a static extension table, for
//! items we haven't (or can't) read.
use std::path::Path;
use std::sync::Mutex;

use derivative::Derivative;

use crate::error::Result;
use crate::locator::ItemId;
use crate::object_pool::StreamLease;
use crate::object_pool::StreamPool;

/// Sentinel type for zero-length content.
pub const EMPTY: &str = "Empty";

/// Sentinel type for extensions missing from the guess table.
pub const UNKNOWN: &str = "Unknown";

/// A byte-sniffing content classifier.
pub trait Sniffer: Send {
    /// Returns the MIME type of `data`, which is never empty.
    fn sniff(&mut self, data: &[u8]) -> String;
}

/// `(offset, signature, type)`.  Order matters: earlier entries win.
static SIGNATURES: &[(usize, &[u8], &str)] = &[
    (0, b"\x89PNG\r\n\x1a\n", "image/png"),
    (0, b"\xff\xd8\xff", "image/jpeg"),
    (0, b"GIF87a", "image/gif"),
    (0, b"GIF89a", "image/gif"),
    (0, b"II*\x00", "image/tiff"),
    (0, b"MM\x00*", "image/tiff"),
    (8, b"WEBP", "image/webp"),
    (8, b"WAVE", "audio/x-wav"),
    (8, b"AVI ", "video/x-msvideo"),
    (0, b"\x00\x00\x01\x00", "image/vnd.microsoft.icon"),
    (0, b"%PDF-", "application/pdf"),
    (0, b"PK\x03\x04", "application/zip"),
    (0, b"\x1f\x8b", "application/gzip"),
    (0, b"BZh", "application/x-bzip2"),
    (0, b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (0, b"Rar!\x1a\x07", "application/x-rar"),
    (0, b"\xfd7zXZ\x00", "application/x-xz"),
    (257, b"ustar", "application/x-tar"),
    (0, b"\x7fELF", "application/x-executable"),
    (0, b"MZ", "application/x-dosexec"),
    (0, b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1", "application/x-ole-storage"),
    (0, b"SQLite format 3\x00", "application/x-sqlite3"),
    (0, b"ID3", "audio/mpeg"),
    (0, b"OggS", "audio/ogg"),
    (0, b"fLaC", "audio/flac"),
    (4, b"ftyp", "video/mp4"),
    (0, b"{\\rtf", "text/rtf"),
];

/// How much of the content we inspect for markup and text.
const TEXT_WINDOW: usize = 64 * 1024;

/// Matches the signature table, then falls back to markup and text
/// heuristics.
#[derive(Clone, Copy, Debug, Default)]
pub struct MagicSniffer;

/// Windows bitmaps start with `BM`, which is also how plenty of text
/// starts; insist on a plausible DIB header size as well.
fn is_bmp(data: &[u8]) -> bool {
    if data.len() < 18 || !data.starts_with(b"BM") {
        return false;
    }

    let header = u32::from_le_bytes([data[14], data[15], data[16], data[17]]);
    matches!(header, 12 | 40 | 52 | 56 | 64 | 108 | 124)
}

/// Returns whether `window` looks like text: valid UTF-8 (a sequence
/// cut off by the window's end is fine) without control characters
/// other than the usual whitespace and escape.
fn looks_like_text(window: &[u8]) -> bool {
    let text = match std::str::from_utf8(window) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&window[..e.valid_up_to()]) {
            Ok(text) => text,
            Err(_) => return false,
        },
        Err(_) => return false,
    };

    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r' | '\x0c' | '\x1b'))
}

impl Sniffer for MagicSniffer {
    fn sniff(&mut self, data: &[u8]) -> String {
        for (offset, signature, mime) in SIGNATURES {
            if data.len() >= offset + signature.len()
                && &data[*offset..offset + signature.len()] == *signature
            {
                return (*mime).to_string();
            }
        }

        if is_bmp(data) {
            return "image/bmp".to_string();
        }

        let window = &data[..data.len().min(TEXT_WINDOW)];
        if !looks_like_text(window) {
            return "application/octet-stream".to_string();
        }

        let head = String::from_utf8_lossy(&window[..window.len().min(512)]);
        let head = head.trim_start().to_ascii_lowercase();
        let mime = if head.starts_with("<!doctype html") || head.starts_with("<html") {
            "text/html"
        } else if head.starts_with("<svg") {
            "image/svg+xml"
        } else if head.starts_with("<?xml") {
            if head.contains("<svg") {
                "image/svg+xml"
            } else {
                "text/xml"
            }
        } else {
            "text/plain"
        };

        mime.to_string()
    }
}

/// Serialises access to one [`Sniffer`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Classifier {
    #[derivative(Debug = "ignore")]
    sniffer: Mutex<Box<dyn Sniffer>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(MagicSniffer)
    }
}

impl Classifier {
    pub fn new(sniffer: impl Sniffer + 'static) -> Classifier {
        Classifier {
            sniffer: Mutex::new(Box::new(sniffer)),
        }
    }

    /// Returns the type of `data`; [`EMPTY`] for empty content.
    pub fn classify(&self, data: &[u8]) -> String {
        if data.is_empty() {
            return EMPTY.to_string();
        }

        let mut sniffer = self.sniffer.lock().unwrap_or_else(|e| e.into_inner());
        sniffer.sniff(data)
    }

    /// Classifies a file that's already on disk (i.e., cached), without
    /// touching the evidence container.
    pub fn classify_path(&self, path: &Path) -> Result<String> {
        let data = std::fs::read(path)?;
        Ok(self.classify(&data))
    }

    /// Reads the whole of `id` through `pool`, then classifies it.
    /// Fails with [`crate::Error::PoolExhausted`] if the pool is full.
    pub fn classify_item<P: StreamPool + ?Sized>(
        &self,
        pool: &P,
        id: &ItemId,
        max_open: usize,
    ) -> Result<String> {
        let data = {
            let lease = StreamLease::require(pool, id, max_open)?;
            lease.read_to_end()?
        };

        Ok(self.classify(&data))
    }
}

/// Extension to type table, sorted by extension.
static TYPES_BY_EXTENSION: &[(&str, &str)] = &[
    ("a", "application/octet-stream"),
    ("ai", "application/postscript"),
    ("aif", "audio/x-aiff"),
    ("aifc", "audio/x-aiff"),
    ("aiff", "audio/x-aiff"),
    ("au", "audio/basic"),
    ("avi", "video/x-msvideo"),
    ("bat", "text/plain"),
    ("bcpio", "application/x-bcpio"),
    ("bin", "application/octet-stream"),
    ("bmp", "image/x-ms-bmp"),
    ("c", "text/plain"),
    ("cdf", "application/x-cdf"),
    ("cpio", "application/x-cpio"),
    ("csh", "application/x-csh"),
    ("css", "text/css"),
    ("dll", "application/octet-stream"),
    ("doc", "application/msword"),
    ("dot", "application/msword"),
    ("dvi", "application/x-dvi"),
    ("eml", "message/rfc822"),
    ("eps", "application/postscript"),
    ("etx", "text/x-setext"),
    ("exe", "application/octet-stream"),
    ("gif", "image/gif"),
    ("gtar", "application/x-gtar"),
    ("h", "text/plain"),
    ("hdf", "application/x-hdf"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("ico", "image/vnd.microsoft.icon"),
    ("ief", "image/ief"),
    ("jpe", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("ksh", "text/plain"),
    ("latex", "application/x-latex"),
    ("m1v", "video/mpeg"),
    ("man", "application/x-troff-man"),
    ("me", "application/x-troff-me"),
    ("mht", "message/rfc822"),
    ("mhtml", "message/rfc822"),
    ("mif", "application/x-mif"),
    ("mov", "video/quicktime"),
    ("movie", "video/x-sgi-movie"),
    ("mp2", "audio/mpeg"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("mpa", "video/mpeg"),
    ("mpe", "video/mpeg"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("ms", "application/x-troff-ms"),
    ("nc", "application/x-netcdf"),
    ("nws", "message/rfc822"),
    ("o", "application/octet-stream"),
    ("obj", "application/octet-stream"),
    ("oda", "application/oda"),
    ("p12", "application/x-pkcs12"),
    ("p7c", "application/pkcs7-mime"),
    ("pbm", "image/x-portable-bitmap"),
    ("pdf", "application/pdf"),
    ("pfx", "application/x-pkcs12"),
    ("pgm", "image/x-portable-graymap"),
    ("pl", "text/plain"),
    ("png", "image/png"),
    ("pnm", "image/x-portable-anymap"),
    ("pot", "application/vnd.ms-powerpoint"),
    ("ppa", "application/vnd.ms-powerpoint"),
    ("ppm", "image/x-portable-pixmap"),
    ("pps", "application/vnd.ms-powerpoint"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("ps", "application/postscript"),
    ("pwz", "application/vnd.ms-powerpoint"),
    ("py", "text/x-python"),
    ("pyc", "application/x-python-code"),
    ("pyo", "application/x-python-code"),
    ("qt", "video/quicktime"),
    ("ra", "audio/x-pn-realaudio"),
    ("ram", "application/x-pn-realaudio"),
    ("ras", "image/x-cmu-raster"),
    ("rdf", "application/xml"),
    ("rgb", "image/x-rgb"),
    ("roff", "application/x-troff"),
    ("rtx", "text/richtext"),
    ("sgm", "text/x-sgml"),
    ("sgml", "text/x-sgml"),
    ("sh", "application/x-sh"),
    ("shar", "application/x-shar"),
    ("snd", "audio/basic"),
    ("so", "application/octet-stream"),
    ("src", "application/x-wais-source"),
    ("sv4cpio", "application/x-sv4cpio"),
    ("sv4crc", "application/x-sv4crc"),
    ("swf", "application/x-shockwave-flash"),
    ("t", "application/x-troff"),
    ("tar", "application/x-tar"),
    ("tcl", "application/x-tcl"),
    ("tex", "application/x-tex"),
    ("texi", "application/x-texinfo"),
    ("texinfo", "application/x-texinfo"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("tr", "application/x-troff"),
    ("tsv", "text/tab-separated-values"),
    ("txt", "text/plain"),
    ("ustar", "application/x-ustar"),
    ("vcf", "text/x-vcard"),
    ("wav", "audio/x-wav"),
    ("wiz", "application/msword"),
    ("wsdl", "application/xml"),
    ("xbm", "image/x-xbitmap"),
    ("xlb", "application/vnd.ms-excel"),
    ("xls", "application/excel"),
    ("xml", "text/xml"),
    ("xpdl", "application/xml"),
    ("xpm", "image/x-xpixmap"),
    ("xsl", "application/xml"),
    ("xwd", "image/x-xwindowdump"),
    ("zip", "application/zip"),
];

/// Guesses a type from a (lower-case, dot-less) extension; [`UNKNOWN`]
/// if the extension isn't in the table.
pub fn guess(extension: &str) -> &'static str {
    match TYPES_BY_EXTENSION.binary_search_by(|(ext, _)| (*ext).cmp(extension)) {
        Ok(index) => TYPES_BY_EXTENSION[index].1,
        Err(_) => UNKNOWN,
    }
}
