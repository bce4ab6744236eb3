//! Object storage abstraction.
//!
//! The queue log directory, staging area, destination table, checkpoint and
//! dead-letter locations are all plain URLs resolved through the same
//! [`StorageProvider`]. Supported backends: GCS, S3 and the local filesystem.

mod gcs;
mod local;
mod s3;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over the supported backends.
///
/// All paths passed to its methods are relative to the key prefix of the URL
/// the provider was created for.
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

const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
}

fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("storage URL pattern must compile"))
                .collect()
        };
        vec![
            (Backend::S3, compile(&[S3_ENDPOINT_URL, S3_URL])),
            (Backend::Gcs, compile(&[GCS_PATH, GCS_URL])),
            (Backend::Local, compile(&[FILE_URI, FILE_PATH])),
        ]
    })
}

/// Backend configuration parsed from a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in matchers() {
            if let Some(captures) = patterns.iter().find_map(|r| r.captures(url)) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&captures),
                    Backend::Gcs => Self::parse_gcs(&captures),
                    Backend::Local => Self::parse_local(&captures),
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(captures: &regex::Captures) -> Self {
        let bucket = captures["bucket"].to_string();
        let endpoint = captures.name("endpoint").map(|endpoint| {
            let port = captures
                .name("port")
                .and_then(|p| p.as_str().parse::<u16>().ok())
                .unwrap_or(443);
            let protocol = captures
                .name("protocol")
                .map(|p| p.as_str())
                .unwrap_or("https");
            format!("{}://{}:{}", protocol, endpoint.as_str(), port)
        });
        let key = captures.name("key").map(|m| Path::from(m.as_str()));

        BackendConfig::S3(S3Config {
            endpoint,
            bucket,
            key,
        })
    }

    fn parse_gcs(captures: &regex::Captures) -> Self {
        let bucket = captures["bucket"].to_string();
        let key = captures.name("key").map(|m| Path::from(m.as_str()));
        BackendConfig::Gcs(GcsConfig { bucket, key })
    }

    fn parse_local(captures: &regex::Captures) -> Self {
        let path = &captures["path"];
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig { path })
    }

    /// Key prefix within the bucket; local providers are rooted at their path.
    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with backend options
    /// (credentials, region, endpoint overrides).
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Create a storage provider for the given URL with no extra options.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Canonical URL of the provider root, for logging.
    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = async {
            self.object_store
                .get(&self.qualify_path(&path))
                .await?
                .bytes()
                .await
        }
        .await;
        record(StorageOperation::Get, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// Get a byte range of an object.
    pub async fn get_range(
        &self,
        path: impl Into<Path>,
        range: Range<u64>,
    ) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self
            .object_store
            .get_range(&self.qualify_path(&path), range)
            .await;
        record(StorageOperation::Get, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// Size of an object in bytes.
    pub async fn size(&self, path: impl Into<Path>) -> Result<u64, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(&path)).await;
        record(StorageOperation::Head, start, result.is_ok());
        Ok(result.context(ObjectStoreSnafu)?.size)
    }

    /// Put bytes to a path. The object becomes visible atomically.
    pub async fn put(
        &self,
        path: impl Into<Path>,
        bytes: impl Into<Bytes>,
    ) -> Result<(), StorageError> {
        let path = path.into();
        let payload = PutPayload::from(bytes.into());
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(&path), payload)
            .await;
        record(StorageOperation::Put, start, result.is_ok());
        result.context(ObjectStoreSnafu)?;
        debug!("Wrote {}/{}", self.canonical_url, path);
        Ok(())
    }

    /// Move an object, replacing the destination if it exists.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .rename(&self.qualify_path(from), &self.qualify_path(to))
            .await;
        record(StorageOperation::Rename, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// Delete an object. Deleting a missing object is not an error.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match self.object_store.delete(&self.qualify_path(path)).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other,
        };
        record(StorageOperation::Delete, start, result.is_ok());
        result.context(ObjectStoreSnafu)
    }

    /// Check whether an object exists.
    pub async fn exists(&self, path: impl Into<Path>) -> Result<bool, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(&path)).await;
        let ok = matches!(result, Ok(_) | Err(object_store::Error::NotFound { .. }));
        record(StorageOperation::Head, start, ok);
        match result {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// List all objects under `prefix`, returning sorted paths relative to
    /// the provider root.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        let full_prefix = self.qualify_path(&Path::from(prefix)).into_owned();
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<_>, _> = self
            .object_store
            .list(Some(&full_prefix))
            .map_ok(|meta| meta.location.parts().skip(key_part_count).collect::<Path>())
            .try_collect()
            .await;
        record(StorageOperation::List, start, result.is_ok());

        let mut paths = result.context(ObjectStoreSnafu)?;
        paths.sort();
        Ok(paths)
    }
}

fn record(operation: StorageOperation, start: Instant, ok: bool) {
    emit!(StorageRequest {
        operation,
        status: if ok {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        },
        duration: start.elapsed(),
    });
}
