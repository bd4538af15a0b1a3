//! Error types for store operations.

use thiserror::Error;

/// Errors raised by stores, revision trees, and attachment stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has been closed; no further operations are possible.
    #[error("store is closed")]
    Closed,

    /// The named document does not exist in this store.
    #[error("document not found: {doc_id}")]
    DocumentNotFound {
        /// Identifier of the missing document.
        doc_id: String,
    },

    /// The revision does not exist in the document's revision tree.
    #[error("revision {rev_id} not found in document {doc_id}")]
    RevisionNotFound {
        /// Identifier of the document that was searched.
        doc_id: String,
        /// The revision identifier that was not found.
        rev_id: String,
    },

    /// A revision identifier could not be parsed.
    #[error("invalid revision id: {reason}")]
    InvalidRevisionId {
        /// Why the identifier was rejected.
        reason: String,
    },

    /// A revision history could not be connected to the existing tree.
    #[error("invalid revision history for document {doc_id}: {reason}")]
    InvalidHistory {
        /// Identifier of the document being written.
        doc_id: String,
        /// Why the history was rejected.
        reason: String,
    },

    /// Attachment content did not hash to its declared digest.
    #[error("attachment digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the content was declared under.
        expected: String,
        /// Digest actually computed from the content.
        actual: String,
    },

    /// Stored data could not be decoded.
    #[error("corrupt store data: {reason}")]
    Corrupt {
        /// What failed to decode.
        reason: String,
    },
}

impl StoreError {
    /// Create a [`StoreError::DocumentNotFound`].
    pub fn doc_not_found(doc_id: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            doc_id: doc_id.into(),
        }
    }

    /// Create a [`StoreError::RevisionNotFound`].
    pub fn rev_not_found(doc_id: impl Into<String>, rev_id: impl ToString) -> Self {
        Self::RevisionNotFound {
            doc_id: doc_id.into(),
            rev_id: rev_id.to_string(),
        }
    }

    /// Create a [`StoreError::InvalidHistory`].
    pub fn invalid_history(doc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHistory {
            doc_id: doc_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a [`StoreError::Corrupt`].
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let err = StoreError::rev_not_found("doc1", "2-abc");
        assert_eq!(err.to_string(), "revision 2-abc not found in document doc1");

        let err = StoreError::invalid_history("doc2", "history does not connect");
        assert!(err.to_string().contains("doc2"));
        assert!(err.to_string().contains("does not connect"));
    }

    #[test]
    fn errors_are_cloneable_and_comparable() {
        let err = StoreError::Closed;
        assert_eq!(err.clone(), StoreError::Closed);
    }
}
