/*!
 * Defines the [EngramError] and [Result] types.
*/

use thiserror::Error;
use uuid::Uuid;

/// Engram error type.
///
/// Every variant is a distinct, matchable failure kind. Callers that need
/// to branch on "the path did not exist at that commit" versus "that commit
/// does not exist" can do so without string inspection.
#[derive(Error, Debug)]
pub enum EngramError {
    /// An entity, blob, branch or key is missing.
    #[error("not found: {0}")]
    NotFound(String),
    /// The target existed in the store but not at the requested commit.
    /// This is a legal state, not a corruption.
    #[error("{target} did not exist at commit {commit}")]
    NotFoundAtCommit {
        /// The commit hash the read was resolved against.
        commit: String,
        /// The path or entity id that was looked up.
        target: String,
    },
    /// The given hash does not resolve to any commit object.
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    /// Stored bytes do not hash to the key they were stored under.
    #[error("corrupt blob {hash}: content hashes to {actual}")]
    CorruptBlob {
        /// The hash the object was addressed by.
        hash: String,
        /// The hash the stored bytes actually produce.
        actual: String,
    },
    /// A vector's length does not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was built with.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },
    /// A vector is not L2-normalized within tolerance.
    #[error("vector is not L2-normalized (norm {norm})")]
    InvalidVector {
        /// The measured L2 norm.
        norm: f32,
    },
    /// The operation requires a vector but the entity was loaded
    /// metadata-only or was stored without one.
    #[error("entity {0} has no vector loaded")]
    MissingVector(Uuid),
    /// A commit or fork was attempted while the `cow-disabled` marker is
    /// present.
    #[error("copy-on-write history is disabled for this store")]
    CowDisabled,
    /// Underlying storage backend failure.
    #[error("backend error: {0}")]
    Backend(#[from] object_store::Error),
    /// A stored record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Local I/O failure (compression, filesystem).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// General error that does not need to be handled and displays a message.
    #[error("{0}")]
    Message(String),
}

/// Engram result type.
pub type Result<T> = std::result::Result<T, EngramError>;
