use thiserror::Error;

/// Reasons a presented key string could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed secret key")]
    Malformed,

    #[error("unexpected key prefix '{0}'")]
    WrongPrefix(String),

    #[error("unsupported key version {0}")]
    UnsupportedVersion(i16),

    #[error("secret key payload is not valid base32")]
    BadEncoding,
}

pub type Result<T> = std::result::Result<T, KeyError>;
