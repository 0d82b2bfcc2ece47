use thiserror::Error;

/// Errors raised while validating values shared between crates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid tenant id {id:?}: {reason}")]
    InvalidTenant { id: String, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
