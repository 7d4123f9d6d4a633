//! Error types for checkpoint conversion.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can occur when reading checkpoints or writing archives.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The input path does not exist.
    #[error("The specified path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// The checkpoint container or pickle stream is malformed.
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// The pickle stream uses a construct outside the supported dialect.
    #[error("Unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A tensor view reaches past the end of its backing storage.
    #[error("Storage '{key}' out of bounds: tensor view needs {needed} bytes, storage has {available}")]
    StorageBounds {
        key: String,
        needed: u64,
        available: u64,
    },

    /// A field the selected variant requires is absent.
    #[error("Required field '{0}' not found in the model")]
    MissingField(String),

    /// An entry expected to hold a tensor holds something else.
    #[error("Invalid tensor entry '{name}': found {found}")]
    InvalidTensorEntry { name: String, found: String },

    /// The dtype has no safetensors representation.
    #[error("Dtype {0} cannot be written to a safetensors archive")]
    UnsupportedDtype(String),

    /// An archive must contain at least one tensor.
    #[error("No tensors to write")]
    EmptyTensorSet,

    /// Unknown model variant name.
    #[error("model_type `{0}` is not supported!")]
    UnsupportedVariant(String),

    /// Two tensors were added under the same name.
    #[error("Duplicate tensor name: {0}")]
    DuplicateTensor(String),

    /// Tensor data size doesn't match its dtype and shape.
    #[error("Expected {expected} bytes, found {found} bytes")]
    InconsistentDataSize { expected: u64, found: u64 },

    /// Archive header serialization failed.
    #[error("Header serialization error: {0}")]
    HeaderJson(#[from] serde_json::Error),
}
