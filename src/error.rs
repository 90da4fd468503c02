//! Error types for recoverable failures

use thiserror::Error;

use crate::alloc::AllocError;

/// Error type for bespoke arrays
///
/// Only setup problems and application-level key lookups are recoverable.
/// Broken layout contracts and corrupted headers are fatal instead.
#[derive(Error, Debug)]
pub enum BespokeError {
    /// Memory allocation failed
    #[error("memory allocation failed")]
    Alloc(#[from] AllocError),
    /// A layout registry has already been installed for this process
    #[error("layout registry is already installed")]
    RegistryInstalled,
    /// No layout index is left below the discriminator bit
    #[error("layout registry is full ({0} layouts)")]
    RegistryFull(usize),
    /// Runtime options could not be parsed
    #[error("invalid runtime options: {0}")]
    Options(#[from] serde_json::Error),
    /// A strict element lookup found no such key
    #[error("undefined array key {0}")]
    MissingKey(String),
}

impl BespokeError {
    /// Result of an element lookup that found no `key`: an error if the
    /// caller asked for strict failure, no slot otherwise.
    pub fn missing<T>(
        throw_on_missing: bool,
        key: impl std::fmt::Display,
    ) -> Result<Option<T>, BespokeError> {
        if throw_on_missing {
            Err(BespokeError::MissingKey(key.to_string()))
        } else {
            Ok(None)
        }
    }
}
