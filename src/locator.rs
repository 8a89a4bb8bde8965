//! Item locators name one entry inside one evidence container.  On
//! the wire, they are JSON path specifications, possibly nested: a
//! file inside a filesystem inside a partition inside a disk image is
//! a `TSK` spec whose `parent` is a `TSK_PARTITION` spec whose parent
//! is an `EWF` spec, and so on.
//!
//! Callers hand us whatever string they received, and we key every
//! pool and cache path on an [`ItemId`].  An `ItemId` always carries
//! the *canonical* re-serialisation of the decoded spec, so two
//! spellings of the same locator (different whitespace or field
//! order) map to the same pool slot and the same cache directory.
use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;

/// The kind of container layer a [`PathSpec`] addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerType {
    /// A file on the host operating system.
    Os,
    /// An entry in a filesystem parsed by a forensic toolkit.
    Tsk,
    TskPartition,
    Vshadow,
    Ewf,
    Qcow,
    Raw,
    Zip,
    Tar,
    Gzip,
    /// In-memory containers (tests and embedders).
    Fake,
}

/// A decoded locator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathSpec {
    pub type_indicator: ContainerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    /// Snapshot index, for volume shadow copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<PathSpec>>,
}

impl PathSpec {
    /// Returns a spec for `location` in a container of type
    /// `type_indicator`, with no inode and no parent.
    pub fn new(type_indicator: ContainerType, location: impl Into<String>) -> PathSpec {
        PathSpec {
            type_indicator,
            location: Some(location.into()),
            inode: None,
            store_index: None,
            parent: None,
        }
    }

    pub fn with_inode(mut self, inode: u64) -> PathSpec {
        self.inode = Some(inode);
        self
    }

    pub fn with_parent(mut self, parent: PathSpec) -> PathSpec {
        self.parent = Some(Box::new(parent));
        self
    }
}

struct Inner {
    encoded: String,
    spec: PathSpec,
}

/// A typed, cheaply clonable item identifier.  Equality, ordering and
/// hashing all go through the canonical encoding.
#[derive(Clone)]
pub struct ItemId(Arc<Inner>);

impl ItemId {
    /// Returns the identifier for `spec`.
    pub fn new(spec: PathSpec) -> Result<ItemId> {
        let encoded = serde_json::to_string(&spec)?;
        Ok(ItemId(Arc::new(Inner { encoded, spec })))
    }

    /// Decodes a serialised locator.
    ///
    /// Fails with [`Error::InvalidLocator`] on empty or malformed input.
    pub fn decode(encoded: &str) -> Result<ItemId> {
        if encoded.trim().is_empty() {
            return Err(Error::InvalidLocator("expected a locator, found none".into()));
        }

        let spec: PathSpec = serde_json::from_str(encoded).map_err(|e| {
            tracing::debug!(locator = encoded, "failed to decode locator");
            Error::InvalidLocator(e.to_string())
        })?;
        ItemId::new(spec)
    }

    /// Returns the canonical serialised form.
    pub fn encoded(&self) -> &str {
        &self.0.encoded
    }

    pub fn spec(&self) -> &PathSpec {
        &self.0.spec
    }

    pub fn container_type(&self) -> ContainerType {
        self.0.spec.type_indicator
    }

    pub fn inode(&self) -> Option<u64> {
        self.0.spec.inode
    }

    /// Returns the in-container path, or the empty string.
    pub fn location(&self) -> &str {
        self.0.spec.location.as_deref().unwrap_or("")
    }

    /// Returns the last component of the location.
    pub fn file_name(&self) -> &str {
        let location = self.location();
        match location.rsplit_once('/') {
            Some((_, name)) => name,
            None => location,
        }
    }

    /// Returns the location of the parent directory: everything up to
    /// the last slash, or `/` for top-level entries.
    pub fn directory(&self) -> &str {
        let location = self.location();
        match location.rsplit_once('/') {
            Some(("", _)) if location.starts_with('/') => "/",
            Some((dir, _)) => dir,
            None => "",
        }
    }

    /// Returns the lower-cased extension of the file name, without the
    /// dot.  Leading dots do not start an extension (`.bashrc` has
    /// none).
    pub fn extension(&self) -> String {
        let name = self.file_name().trim_start_matches('.');
        match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_lowercase(),
            None => String::new(),
        }
    }

    /// Returns the hex SHA-1 of the canonical encoding.  This names the
    /// cache shard directory: it's a digest of the *locator*, not of
    /// the item's contents.
    pub fn digest(&self) -> String {
        use extendhash::sha1;
        use std::fmt::Write;

        let hash = sha1::compute_hash(self.encoded().as_bytes());
        let mut hex = String::with_capacity(2 * hash.len());
        for byte in hash.iter() {
            let _ = write!(hex, "{:02x}", byte);
        }

        hex
    }
}

impl PartialEq for ItemId {
    fn eq(&self, other: &ItemId) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.encoded() == other.encoded()
    }
}

impl Eq for ItemId {}

impl Hash for ItemId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded().hash(state)
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &ItemId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &ItemId) -> Ordering {
        self.encoded().cmp(other.encoded())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoded())
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ItemId").field(&self.encoded()).finish()
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(encoded: &str) -> Result<ItemId> {
        ItemId::decode(encoded)
    }
}

impl Serialize for ItemId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.encoded())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        ItemId::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use crate::locator::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn id(location: &str) -> ItemId {
        ItemId::new(PathSpec::new(ContainerType::Tsk, location)).expect("must encode")
    }

    #[test]
    fn test_decode_nested() {
        let item = ItemId::decode(
            r#"{"type_indicator": "TSK", "location": "/Users/x/photo.JPG", "inode": 15,
                "parent": {"type_indicator": "TSK_PARTITION", "location": "/p1",
                           "parent": {"type_indicator": "EWF",
                                      "parent": {"type_indicator": "OS", "location": "/evidence/disk.E01"}}}}"#,
        )
        .expect("must decode");

        assert_eq!(item.container_type(), ContainerType::Tsk);
        assert_eq!(item.inode(), Some(15));
        assert_eq!(item.location(), "/Users/x/photo.JPG");
        assert_eq!(item.file_name(), "photo.JPG");
        assert_eq!(item.directory(), "/Users/x");
        assert_eq!(item.extension(), "jpg");

        let parent = item.spec().parent.as_ref().expect("has parent");
        assert_eq!(parent.type_indicator, ContainerType::TskPartition);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(ItemId::decode(""), Err(Error::InvalidLocator(_))));
        assert!(matches!(ItemId::decode("   "), Err(Error::InvalidLocator(_))));
        assert!(matches!(ItemId::decode("not json"), Err(Error::InvalidLocator(_))));
        assert!(matches!(
            ItemId::decode(r#"{"type_indicator": "FLOPPY"}"#),
            Err(Error::InvalidLocator(_))
        ));
        assert!(matches!(
            ItemId::decode(r#"{"type_indicator": "OS", "colour": "blue"}"#),
            Err(Error::InvalidLocator(_))
        ));
    }

    // Different spellings of the same locator must collapse to one key.
    #[test]
    fn test_canonical_key() {
        let a = ItemId::decode(r#"{"type_indicator":"TSK","location":"/a.txt","inode":3}"#)
            .expect("must decode");
        let b = ItemId::decode(r#"{ "inode": 3, "location": "/a.txt", "type_indicator": "TSK" }"#)
            .expect("must decode");

        assert_eq!(a, b);
        assert_eq!(a.encoded(), b.encoded());
        assert_eq!(a.digest(), b.digest());

        let set: HashSet<ItemId> = vec![a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_path_components() {
        assert_eq!(id("/top.txt").directory(), "/");
        assert_eq!(id("/top.txt").file_name(), "top.txt");
        assert_eq!(id("relative").directory(), "");
        assert_eq!(id("relative").file_name(), "relative");
        assert_eq!(id("/dir/").file_name(), "");

        assert_eq!(id("/a/archive.tar.GZ").extension(), "gz");
        assert_eq!(id("/a/.bashrc").extension(), "");
        assert_eq!(id("/a/noext").extension(), "");
        assert_eq!(id("/a/trailing.").extension(), "");
    }

    #[test]
    fn test_digest_is_sha1_hex() {
        let digest = id("/a.txt").digest();

        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(digest, id("/b.txt").digest());
    }

    #[test]
    fn test_serde_as_string() {
        let item = id("/a.txt");
        let json = serde_json::to_string(&item).expect("must serialize");
        let back: ItemId = serde_json::from_str(&json).expect("must deserialize");

        assert_eq!(back, item);
        assert!(serde_json::from_str::<ItemId>("\"{}\"").is_err());
    }

    proptest! {
        #[test]
        fn test_extension_shape(location in "(/[a-zA-Z0-9._ ]{0,12}){1,4}") {
            let ext = id(&location).extension();

            assert!(!ext.contains('.'));
            assert!(!ext.contains('/'));
            assert_eq!(ext.to_lowercase(), ext);
        }

        #[test]
        fn test_encoding_is_a_fixpoint(location in "[ -~]{0,40}", inode in any::<Option<u64>>()) {
            let mut spec = PathSpec::new(ContainerType::Fake, location);
            spec.inode = inode;

            let item = ItemId::new(spec).expect("must encode");
            let again = ItemId::decode(item.encoded()).expect("must decode");
            assert_eq!(again.encoded(), item.encoded());
            assert_eq!(again.spec(), item.spec());
        }
    }
}
