use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::{
    client::{Client as GcsClient, ClientConfig},
    http::objects::upload::{Media, UploadObjectRequest, UploadType},
};
use tracing::info;
use url::Url;

/// An artifact that now lives in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub name: String,
    pub public_url: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_file(&self, bucket: &str, object_name: &str, path: &Path)
        -> Result<StoredObject>;
}

/// Google Cloud Storage, authenticated through application-default credentials.
pub struct GcsStore {
    client: GcsClient,
    public_base_url: String,
}

impl GcsStore {
    pub async fn from_environment(public_base_url: impl Into<String>) -> Result<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .context("failed to initialize GCS credentials")?;
        Ok(Self {
            client: GcsClient::new(config),
            public_base_url: public_base_url.into(),
        })
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn upload_file(
        &self,
        bucket: &str,
        object_name: &str,
        path: &Path,
    ) -> Result<StoredObject> {
        let public_url = public_url(&self.public_base_url, bucket, object_name)?;
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read artifact for upload: {}", path.display()))?;
        let size = data.len() as u64;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        info!(
            path = %path.display(),
            size,
            content_type = %content_type,
            "Uploading to gs://{}/{}", bucket, object_name
        );

        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: bucket.to_string(),
                    ..Default::default()
                },
                Bytes::from(data),
                &UploadType::Simple(Media {
                    name: object_name.to_string().into(),
                    content_type: content_type.into(),
                    content_length: Some(size),
                }),
            )
            .await
            .map_err(|e| anyhow!("failed to upload gs://{bucket}/{object_name}: {e}"))?;

        Ok(StoredObject {
            bucket: bucket.to_string(),
            name: object_name.to_string(),
            public_url,
        })
    }
}

/// `<base>/<bucket>/<object name>`, each path segment percent-encoded while
/// `/` inside the object name stays a separator.
pub fn public_url(base: &str, bucket: &str, object_name: &str) -> Result<String> {
    let mut url =
        Url::parse(base).with_context(|| format!("invalid public base URL: {base}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("public base URL cannot carry a path: {base}"))?
        .pop_if_empty()
        .push(bucket)
        .extend(object_name.split('/'));
    Ok(url.to_string())
}
