//! Typed records stored through a versioned envelope.
//!
//! Objects are never written bare. Each one is wrapped as
//! `{"v": <schema version>, "data": <record>}` so that a process running an
//! older or newer layout reads a mismatched record as a miss instead of
//! misinterpreting it.

use std::time::Duration;

use async_trait::async_trait;
use lora_constants::cache::CACHE_SCHEMA_VERSION;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::warn;

use crate::error::CacheStoreError;
use crate::error::SerializationSnafu;
use crate::store::CacheStore;

/// A record that may be stored in the shared cache.
pub trait CachedRecord: Serialize + DeserializeOwned + Send + Sync {
    /// Layout version. Bump when the serialized shape changes.
    const SCHEMA_VERSION: u32 = CACHE_SCHEMA_VERSION;

    /// Short record name used in logs.
    const KIND: &'static str;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    v: u32,
    data: serde_json::Value,
}

/// Encode a record into its envelope string.
pub(crate) fn encode<T: CachedRecord>(key: &str, value: &T) -> Result<String, CacheStoreError> {
    serde_json::to_string(&EnvelopeRef {
        v: T::SCHEMA_VERSION,
        data: value,
    })
    .context(SerializationSnafu { key })
}

/// Decode an envelope string. A schema mismatch decodes to `None`.
pub(crate) fn decode<T: CachedRecord>(key: &str, raw: &str) -> Result<Option<T>, CacheStoreError> {
    let envelope: RawEnvelope = serde_json::from_str(raw).map_err(|e| CacheStoreError::CorruptedData {
        key: key.to_string(),
        reason: format!("invalid envelope: {e}"),
    })?;

    if envelope.v != T::SCHEMA_VERSION {
        warn!(
            key,
            kind = T::KIND,
            found = envelope.v,
            expected = T::SCHEMA_VERSION,
            "cached record has a different schema version, treating as miss"
        );
        return Ok(None);
    }

    serde_json::from_value(envelope.data).map(Some).map_err(|e| CacheStoreError::CorruptedData {
        key: key.to_string(),
        reason: format!("invalid {}: {e}", T::KIND),
    })
}

/// Typed object access for every [`CacheStore`].
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    /// Read and decode a record. Absent, expired and schema-mismatched keys
    /// all read as `None`.
    async fn object_get<T: CachedRecord>(&self, key: &str) -> Result<Option<T>, CacheStoreError> {
        match self.string_get(key).await? {
            Some(raw) => decode(key, &raw),
            None => Ok(None),
        }
    }

    /// Encode and write a record. Same set-if-absent semantics as `string_set`.
    async fn object_set<T: CachedRecord>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        only_if_not_exists: bool,
    ) -> Result<bool, CacheStoreError> {
        let raw = encode(key, value)?;
        self.string_set(key, &raw, ttl, only_if_not_exists).await
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}
