use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("state file ends early: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("invalid state file magic")]
    InvalidMagic,

    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt state file: {0}")]
    Corrupt(&'static str),

    #[error("duplicate section `{0}`")]
    DuplicateSection(String),

    #[error("missing section `{0}`")]
    MissingSection(String),

    #[error("section `{name}` has {found} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
