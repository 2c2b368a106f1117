use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("cas mismatch")]
    InvalidCas,

    #[error("entry exceeds maximum block size")]
    EntryTooLarge,

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("engine closed")]
    Closed,
}

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Error {
        Error::Corruption(msg.into())
    }
}
