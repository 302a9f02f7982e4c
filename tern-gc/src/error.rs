use crate::class::ClassId;
use crate::handle::Handle;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    #[error("stale handle {0}")]
    StaleHandle(Handle),

    #[error("slab exhausted: requested {requested} bytes, {available} available")]
    OutOfSlab { requested: usize, available: usize },

    #[error("out of memory: requested {requested} bytes with a {limit} byte heap limit")]
    OutOfMemory { requested: usize, limit: usize },

    #[error("type {0} is already registered")]
    DuplicateType(String),

    #[error("type {0} not found")]
    NotFound(String),

    #[error("invalid descriptor for {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("expected an instance of {expected}, found {found}")]
    WrongType { expected: String, found: String },

    #[error("handle {0} is not rooted")]
    NotRooted(Handle),

    #[error("offset {offset} is not a valid field of class {class:?}")]
    InvalidField { class: ClassId, offset: usize },

    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),

    #[error("heap corrupted: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, GcError>;
