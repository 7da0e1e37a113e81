//! Object storage abstraction.
//!
//! Provides a unified interface for writing batches to S3, the local
//! filesystem, or an in-memory store.

mod local;
mod memory;
mod s3;
mod url_parser;

pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Content metadata attached to an uploaded object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentMetadata {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl ContentMetadata {
    fn to_attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        if let Some(content_type) = &self.content_type {
            attributes.insert(
                Attribute::ContentType,
                AttributeValue::from(content_type.clone()),
            );
        }
        if let Some(content_encoding) = &self.content_encoding {
            attributes.insert(
                Attribute::ContentEncoding,
                AttributeValue::from(content_encoding.clone()),
            );
        }
        attributes
    }

    fn from_attributes(attributes: &Attributes) -> Self {
        Self {
            content_type: attributes
                .get(&Attribute::ContentType)
                .map(|v| AsRef::<str>::as_ref(v).to_string()),
            content_encoding: attributes
                .get(&Attribute::ContentEncoding)
                .map(|v| AsRef::<str>::as_ref(v).to_string()),
        }
    }
}

/// Object contents together with the metadata stored alongside them.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub metadata: ContentMetadata,
}

/// Storage provider that abstracts over different storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Normalized URL of the storage location.
    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, PutPayload::from(bytes), PutOptions::default())
            .await
    }

    /// Put bytes to a path with content metadata.
    ///
    /// Local filesystem doesn't support attributes, so they are skipped there.
    pub async fn put_with_metadata(
        &self,
        path: &Path,
        bytes: Bytes,
        metadata: &ContentMetadata,
    ) -> Result<(), StorageError> {
        if !self.config.supports_attributes() {
            return self.put(path, bytes).await;
        }

        let opts = PutOptions {
            attributes: metadata.to_attributes(),
            ..Default::default()
        };
        self.put_payload_with_opts(path, PutPayload::from(bytes), opts)
            .await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: RequestStatus::from_ok(result.is_ok()),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Put,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Get the contents of an object and its stored metadata.
    pub async fn get(&self, path: &Path) -> Result<StoredObject, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: RequestStatus::from_ok(result.is_ok()),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Get,
            duration: start.elapsed(),
        });

        let result = result.context(ObjectStoreSnafu)?;
        let metadata = ContentMetadata::from_attributes(&result.attributes);
        let bytes = result.bytes().await.context(ObjectStoreSnafu)?;
        Ok(StoredObject { bytes, metadata })
    }

    /// List objects under `prefix`, returning paths relative to the
    /// configured key prefix, sorted.
    pub async fn list(&self, prefix: Option<&Path>) -> Result<Vec<Path>, StorageError> {
        let base_parts = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let full_prefix = match prefix {
            Some(prefix) => Some(self.qualify_path(prefix).into_owned()),
            None => self.config.key().cloned(),
        };

        let mut paths: Vec<Path> = self
            .object_store
            .list(full_prefix.as_ref())
            .map_ok(|meta| meta.location.parts().skip(base_parts).collect())
            .try_collect()
            .await
            .context(ObjectStoreSnafu)?;

        paths.sort();
        Ok(paths)
    }
}
