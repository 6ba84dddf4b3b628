use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::TransferError;

/// Whole-object access to named buckets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, path: &str) -> Result<Vec<u8>, TransferError>;

    /// Stores `body` under `key`, replacing any existing object, and returns
    /// the key the store confirmed.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, TransferError>;
}

/// Supabase Storage over its REST interface.
#[derive(Clone)]
pub struct SupabaseStorage {
    client: reqwest::Client,
    base_url: Url,
    service_key: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key")]
    key: Option<String>,
}

impl SupabaseStorage {
    pub fn new(base_url: &str, service_key: &str) -> Result<Self, TransferError> {
        let invalid = |reason: String| TransferError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let parsed = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("not a base url".into()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: parsed,
            service_key: service_key.to_string(),
        })
    }

    /// Each `/`-separated part of `path` becomes its own percent-encoded
    /// segment, so `#`, `?` and spaces in object names survive.
    fn object_url(&self, bucket: &str, path: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["storage", "v1", "object", bucket])
                .extend(path.split('/'));
        }
        url
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    #[instrument(name = "storage.get", skip(self))]
    async fn get(&self, bucket: &str, path: &str) -> Result<Vec<u8>, TransferError> {
        let response = self
            .authorized(self.client.get(self.object_url(bucket, path)))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.bytes().await?.to_vec());
        }

        let body = response.text().await.unwrap_or_default();
        // Storage reports a missing object either as a 404 or as a 400 whose
        // body carries the not-found code.
        if status == StatusCode::NOT_FOUND
            || (status == StatusCode::BAD_REQUEST && body.to_lowercase().contains("not found"))
        {
            return Err(TransferError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        Err(TransferError::Http {
            status: status.as_u16(),
            body,
        })
    }

    #[instrument(name = "storage.put", skip(self, body), fields(size = body.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, TransferError> {
        let response = self
            .authorized(self.client.post(self.object_url(bucket, key)))
            .header("content-type", content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        match response.json::<UploadResponse>().await {
            Ok(UploadResponse { key: Some(remote) }) => debug!(remote = %remote, "Upload confirmed"),
            Ok(_) => debug!("Upload confirmed without key"),
            Err(err) => warn!(error = %err, "Could not read upload confirmation"),
        }

        Ok(key.to_string())
    }
}

/// Buckets as directories under a root, for local runs and tests.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn get(&self, bucket: &str, path: &str) -> Result<Vec<u8>, TransferError> {
        let not_found = || TransferError::NotFound {
            bucket: bucket.to_string(),
            path: path.to_string(),
        };
        let file = self.object_path(bucket, path).ok_or_else(not_found)?;

        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, TransferError> {
        let file = self.object_path(bucket, key).ok_or_else(|| TransferError::Http {
            status: 400,
            body: format!("invalid key {key:?}"),
        })?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, body).await?;
        Ok(key.to_string())
    }
}

/// Moves whole files between buckets and the local scratch directory.
#[derive(Clone)]
pub struct FileTransfer {
    store: Arc<dyn ObjectStore>,
    scratch_dir: PathBuf,
}

impl FileTransfer {
    pub fn new(store: Arc<dyn ObjectStore>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Downloads `path` to a fresh scratch file that keeps the object's
    /// extension, returning the scratch path.
    #[instrument(skip(self))]
    pub async fn download(&self, bucket: &str, path: &str) -> Result<PathBuf, TransferError> {
        let mut dest = self.scratch_dir.join(Uuid::new_v4().to_string());
        if let Some(ext) = Path::new(path).extension() {
            dest.set_extension(ext);
        }

        let bytes = self.store.get(bucket, path).await?;

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        if let Err(err) = tokio::fs::write(&dest, &bytes).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(err.into());
        }

        debug!(dest = %dest.display(), size = bytes.len(), "Downloaded object");
        Ok(dest)
    }

    #[instrument(skip(self, local), fields(local = %local.display()))]
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        local: &Path,
        content_type: &str,
    ) -> Result<String, TransferError> {
        let body = tokio::fs::read(local).await?;
        self.store.put(bucket, key, body, content_type).await
    }
}
