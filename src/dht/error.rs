use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("datagram of {0} bytes exceeds the maximum datagram size")]
    DatagramTooLarge(usize),

    #[error("fragment of {0} bytes exceeds the maximum fragment size")]
    FragmentTooLarge(usize),
}
