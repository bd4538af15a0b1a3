//! Content-addressed attachment storage.
//!
//! Attachments live outside document bodies and are addressed by the
//! sha2-256 digest of their content. Two attachments with the same bytes
//! share one stored blob, and replication can skip any blob the other side
//! already holds.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

/// sha2-256 digest identifying one attachment's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BlobDigest([u8; 32]);

impl BlobDigest {
    /// Compute the digest of a blob's content.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        BlobDigest(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for BlobDigest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| StoreError::corrupt("bad blob digest hex"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| StoreError::corrupt("blob digest must be 32 bytes"))?;
        Ok(BlobDigest(bytes))
    }
}

impl From<BlobDigest> for String {
    fn from(digest: BlobDigest) -> Self {
        digest.to_string()
    }
}

impl TryFrom<String> for BlobDigest {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Metadata linking a named attachment on a revision to its stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Attachment name, unique within one revision.
    pub name: String,
    /// Digest of the attachment content.
    pub digest: BlobDigest,
    /// MIME type recorded when the attachment was saved.
    pub content_type: String,
    /// Content length in bytes.
    pub length: u64,
}

/// Attachment content being saved alongside a document body.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    /// Attachment name.
    pub name: String,
    /// MIME type of the content.
    pub content_type: String,
    /// The content itself.
    pub data: Bytes,
}

impl NewAttachment {
    /// Convenience constructor.
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        NewAttachment {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// Content-addressed blob storage backing a document store.
pub trait AttachmentStore: Send + Sync {
    /// Whether a blob with this digest is already stored.
    fn contains(&self, digest: &BlobDigest) -> StoreResult<bool>;

    /// Read a blob's content, or `None` if it is not stored.
    fn read(&self, digest: &BlobDigest) -> StoreResult<Option<Bytes>>;

    /// Store a blob under its digest.
    ///
    /// The content is hashed and verified against `digest`; storing the same
    /// blob twice keeps a single copy.
    fn write(&self, digest: &BlobDigest, content: Bytes) -> StoreResult<()>;

    /// Number of distinct blobs stored.
    fn blob_count(&self) -> StoreResult<u64>;
}

/// In-memory [`AttachmentStore`], shared by cloning the handle.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttachmentStore {
    blobs: Arc<RwLock<HashMap<BlobDigest, Bytes>>>,
}

impl MemoryAttachmentStore {
    /// Create an empty attachment store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttachmentStore for MemoryAttachmentStore {
    fn contains(&self, digest: &BlobDigest) -> StoreResult<bool> {
        Ok(self.blobs.read().contains_key(digest))
    }

    fn read(&self, digest: &BlobDigest) -> StoreResult<Option<Bytes>> {
        Ok(self.blobs.read().get(digest).cloned())
    }

    fn write(&self, digest: &BlobDigest, content: Bytes) -> StoreResult<()> {
        let actual = BlobDigest::of(&content);
        if actual != *digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        self.blobs.write().entry(*digest).or_insert(content);
        Ok(())
    }

    fn blob_count(&self) -> StoreResult<u64> {
        Ok(self.blobs.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_parseable() {
        let a = BlobDigest::of(b"hello");
        let b = BlobDigest::of(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, BlobDigest::of(b"other"));

        let parsed: BlobDigest = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("zz".parse::<BlobDigest>().is_err());
        assert!("abcd".parse::<BlobDigest>().is_err());
    }

    #[test]
    fn write_verifies_content_against_digest() {
        let store = MemoryAttachmentStore::new();
        let digest = BlobDigest::of(b"image-bytes");
        store.write(&digest, Bytes::from_static(b"image-bytes")).unwrap();
        assert!(store.contains(&digest).unwrap());

        let err = store
            .write(&digest, Bytes::from_static(b"tampered"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
    }

    #[test]
    fn identical_content_is_stored_once() {
        let store = MemoryAttachmentStore::new();
        let digest = BlobDigest::of(b"shared");
        store.write(&digest, Bytes::from_static(b"shared")).unwrap();
        store.write(&digest, Bytes::from_static(b"shared")).unwrap();
        assert_eq!(store.blob_count().unwrap(), 1);
        assert_eq!(
            store.read(&digest).unwrap(),
            Some(Bytes::from_static(b"shared"))
        );
    }

    #[test]
    fn reading_a_missing_blob_returns_none() {
        let store = MemoryAttachmentStore::new();
        assert_eq!(store.read(&BlobDigest::of(b"absent")).unwrap(), None);
    }
}
