//! Writes encoded batches to object storage under unique keys.

use object_store::path::Path;
use snafu::prelude::*;
use std::fmt;
use uuid::Uuid;

use crate::encode::EncodedBatch;
use crate::error::{InvalidKeySnafu, StorageError};
use crate::storage::{ContentMetadata, StorageProviderRef};

/// Object key of one uploaded batch: `{prefix}/{uuid}.json.gz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey(String);

impl UploadKey {
    /// A fresh key under `prefix`.
    pub fn generate(prefix: &str) -> Self {
        Self::with_id(prefix, Uuid::new_v4())
    }

    fn with_id(prefix: &str, id: Uuid) -> Self {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            Self(format!("{id}.json.gz"))
        } else {
            Self(format!("{prefix}/{id}.json.gz"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as a store path, without any percent-encoding.
    pub fn to_path(&self) -> Result<Path, StorageError> {
        Path::parse(&self.0).context(InvalidKeySnafu { key: self.0.as_str() })
    }
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// PUTs gzipped NDJSON with the headers downstream readers need to decompress it.
#[derive(Debug, Clone)]
pub struct Uploader {
    storage: StorageProviderRef,
    prefix: String,
    metadata: ContentMetadata,
}

impl Uploader {
    pub fn new(storage: StorageProviderRef, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            metadata: ContentMetadata {
                content_type: Some("text/plain".to_string()),
                content_encoding: Some("gzip".to_string()),
            },
        }
    }

    /// Upload one batch under a freshly generated key.
    ///
    /// A retried call writes under a new key, so a PUT that reached the store
    /// before failing client-side can leave an extra object behind.
    pub async fn upload(&self, batch: &EncodedBatch) -> Result<UploadKey, StorageError> {
        let key = UploadKey::generate(&self.prefix);
        self.storage
            .put_with_metadata(&key.to_path()?, batch.bytes.clone(), &self.metadata)
            .await?;
        Ok(key)
    }
}
