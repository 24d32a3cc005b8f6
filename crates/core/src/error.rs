use thiserror::Error;

use crate::crypto::CryptoError;

/// Application-level error for stash operations. `code()` yields the stable
/// tag carried in daemon responses.
#[derive(Debug, Error)]
pub enum StashError {
    #[error("stash is locked")]
    Locked,

    #[error("wrong password")]
    WrongPassword,

    #[error("stash is not initialized")]
    NoStash,

    #[error("stash file is corrupted: {0}")]
    CorruptStash(String),

    #[error("key '{0}' not found")]
    NoSuchKey(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("stash already exists")]
    AlreadyInitialized,

    #[error("password cannot be empty")]
    EmptyPassword,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StashError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Locked => "Locked",
            Self::WrongPassword => "WrongPassword",
            Self::NoStash => "NoStash",
            Self::CorruptStash(_) => "CorruptStash",
            Self::NoSuchKey(_) => "NoSuchKey",
            Self::InvalidKey(_) => "InvalidKey",
            Self::AlreadyInitialized => "AlreadyInitialized",
            Self::EmptyPassword => "EmptyPassword",
            Self::BadRequest(_) => "BadRequest",
            Self::Internal(_) => "Internal",
        }
    }
}

impl From<std::io::Error> for StashError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<CryptoError> for StashError {
    fn from(err: CryptoError) -> Self {
        match err {
            // Wrong password and a tampered file are deliberately the same tag.
            CryptoError::Auth => Self::WrongPassword,
            CryptoError::KdfParams { .. } => Self::CorruptStash(err.to_string()),
            CryptoError::ResourceExhausted { .. } | CryptoError::Backend => {
                Self::Internal(err.to_string())
            }
        }
    }
}
