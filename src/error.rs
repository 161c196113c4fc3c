//! Error taxonomy shared by the storage and HTTP layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Model is not one of the supported chat sites.
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Malformed or out-of-range caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing, invalid, expired, or wrong-type bearer credential.
    #[error("Unauthorized")]
    Unauthorized,

    /// The token-signing secret is not configured.
    #[error("Token signing secret is not configured")]
    MissingSecret,

    /// Store-level failure. Transient contention is absorbed by the
    /// connection's busy timeout before it surfaces here.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Identity-provider call failed.
    #[error("Identity provider error: {0}")]
    Idp(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
