//! Error types for the shared cache store.

use snafu::Snafu;

/// Errors from the shared cache store.
///
/// Lock contention is not an error: `lock_take` reports it as `Ok(false)`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheStoreError {
    /// The store could not be reached or refused the operation.
    #[snafu(display("cache unavailable: {reason}"))]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },

    /// Key rejected by the store.
    #[snafu(display("invalid cache key '{key}': {reason}"))]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// Stored value is not a valid record envelope.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    CorruptedData {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// A record could not be encoded.
    #[snafu(display("serialization error for key '{key}': {source}"))]
    Serialization {
        /// The key being written.
        key: String,
        /// The underlying error.
        source: serde_json::Error,
    },
}
