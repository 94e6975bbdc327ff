use thiserror::Error;

/// Top-level error for host construction and fragment operations.
#[derive(Debug, Error)]
pub enum KadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dht error: {0}")]
    Dht(#[from] crate::dht::DhtError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}
