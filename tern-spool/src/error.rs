//! Error types for the tern-spool crate.

use std::io;

use thiserror::Error;

use crate::EntryId;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Entry not found: {0}")]
    NotFound(EntryId),

    #[error("Spool validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(EntryId),

    /// The configured entry limit has been reached.
    #[error("Store is full ({0} entries)")]
    Full(usize),
}

impl SpoolError {
    /// Failures that may succeed if the caller tries again later.
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Full(_) | Self::Internal(_))
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The stored envelope names a different entry than its file.
    #[error("Corrupted entry data: {0}")]
    Corrupted(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Spool path cannot contain '..' components: {0}")]
    ParentComponent(String),

    #[error("Spool path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Spool path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

impl<T> From<std::sync::PoisonError<T>> for SpoolError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<bincode::error::EncodeError> for SpoolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for SpoolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}
