use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcError {
    #[error("store error: {0}")]
    Store(#[from] agora_store::StoreError),

    #[error("blob error: {0}")]
    Blob(#[from] agora_blob::BlobError),

    #[error("stable-pass table lock poisoned")]
    LockPoisoned,
}

pub type GcResult<T> = Result<T, GcError>;
