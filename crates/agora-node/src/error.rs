use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("write to {0} was superseded by a newer operation")]
    Superseded(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] agora_store::StoreError),

    #[error("blob store error: {0}")]
    Blob(#[from] agora_blob::BlobError),

    #[error("gc error: {0}")]
    Gc(#[from] agora_gc::GcError),

    #[error("sync error: {0}")]
    Sync(#[from] agora_sync::SyncError),

    #[error(transparent)]
    Fetch(#[from] agora_sync::FetchError),

    #[error("protocol error: {0}")]
    Protocol(#[from] agora_protocol::ProtocolError),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;
