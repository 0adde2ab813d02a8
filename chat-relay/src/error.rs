use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay capacity must be at least one record")]
    ZeroCapacity,
    #[error("message hub is no longer running")]
    HubClosed,
}
