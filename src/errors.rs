use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("consensus node unavailable: {0}")]
    Upstream(String),
    #[error("payload decode error: {0}")]
    PayloadDecode(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type IndexerResult<T> = Result<T, IndexerError>;
