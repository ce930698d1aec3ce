//! Error types for V2F dictionary construction and serialization.

use thiserror::Error;

/// Error variants for V2F operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The symbol distribution violates a `Source` invariant.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// A tree must be able to hold every symbol of the alphabet at least once.
    #[error("tree size {size} is smaller than the alphabet size {alphabet}")]
    TreeTooSmall {
        /// Requested number of included nodes.
        size: usize,
        /// Number of symbols in the source.
        alphabet: usize,
    },

    /// A builder or forest parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An iterative search ran out of its iteration budget.
    #[error("{what} did not converge after {iterations} iterations")]
    NotConverged {
        /// Name of the search that failed.
        what: &'static str,
        /// Iterations used before giving up.
        iterations: usize,
    },

    /// A label that is not part of the source alphabet was given for coding.
    #[error("symbol {0} is not part of the source alphabet")]
    UnknownSymbol(u32),

    /// The current tree has no word prefixing the remaining input.
    #[error("incomplete dictionary: no word matches the remaining input")]
    IncompleteDictionary,

    /// A coded node does not belong to this forest.
    #[error("node reference does not point to an included node of this forest")]
    InvalidNodeRef,

    /// A coded message cannot be decoded by this forest.
    #[error("invalid coded message: {0}")]
    InvalidMessage(String),

    /// The forest uses a routing table the v2f header cannot express.
    #[error("forest routing cannot be expressed in a v2f header")]
    UnsupportedRouting,

    /// The v2f header is inconsistent with the structure it describes.
    #[error("corrupted v2f header: {0}")]
    CorruptedHeader(String),

    /// The forest archive is inconsistent with the structure it describes.
    #[error("corrupted forest archive: {0}")]
    CorruptedArchive(String),

    /// An I/O error occurred while reading or writing a header.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON error occurred while reading or writing an archive.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for V2F operations.
pub type Result<T> = std::result::Result<T, Error>;
