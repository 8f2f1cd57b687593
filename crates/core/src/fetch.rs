use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::config::DownloadConfig;

const TEMP_FILE_PREFIX: &str = "wanvid-input-";
const TEMP_FILE_SUFFIX: &str = ".png";

#[derive(Debug, Error)]
pub enum FetchError {
    /// The source URL was unusable or the remote side failed.
    #[error("{0:#}")]
    Remote(anyhow::Error),
    /// The scratch file could not be written.
    #[error("{0:#}")]
    Local(anyhow::Error),
}

/// Downloads remote input images into the scratch directory.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    scratch_dir: PathBuf,
    max_attempts: usize,
    retry_backoff: Duration,
}

/// A downloaded image. The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct FetchedImage {
    path: TempPath,
    size: u64,
}

impl FetchedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the file now, surfacing the error instead of swallowing it in `Drop`.
    pub fn close(self) -> std::io::Result<()> {
        self.path.close()
    }
}

struct AttemptError {
    retryable: bool,
    error: FetchError,
}

impl AttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error: FetchError::Remote(error),
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error: FetchError::Remote(error),
        }
    }

    fn local(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error: FetchError::Local(error),
        }
    }

    fn from_reqwest(err: reqwest::Error, message: String) -> Self {
        let retryable = is_retryable_reqwest_error(&err);
        let error = anyhow!("{message}: {}", err.without_url());
        if retryable {
            Self::retryable(error)
        } else {
            Self::fatal(error)
        }
    }
}

impl ImageFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .context("failed to build HTTP client for image fetcher")?;

        Ok(Self {
            client,
            scratch_dir: config.scratch_dir.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<FetchedImage, FetchError> {
        let url = parse_http_url(raw_url).map_err(FetchError::Remote)?;
        let redacted = redacted_url_for_display(&url);
        debug!(url = %redacted, "downloading input image");

        let mut attempt = 1;
        loop {
            let AttemptError { retryable, error } = match self.fetch_once(&url, &redacted).await {
                Ok(image) => return Ok(image),
                Err(attempt_error) => attempt_error,
            };

            if retryable && attempt < self.max_attempts {
                debug!(
                    url = %redacted,
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %error,
                    "download attempt failed; retrying"
                );
                tokio::time::sleep(self.retry_backoff.saturating_mul(attempt as u32)).await;
                attempt += 1;
                continue;
            }

            if retryable && self.max_attempts > 1 {
                return Err(FetchError::Remote(anyhow!(
                    "download failed after {} attempts for {}: {}",
                    self.max_attempts,
                    redacted,
                    error
                )));
            }

            return Err(error);
        }
    }

    async fn fetch_once(&self, url: &Url, redacted: &str) -> Result<FetchedImage, AttemptError> {
        let mut response = self.client.get(url.clone()).send().await.map_err(|err| {
            AttemptError::from_reqwest(err, format!("failed to start download from {redacted}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error = anyhow!(
                "download request returned HTTP {} for {}",
                status.as_u16(),
                redacted
            );
            return Err(if is_retryable_status(status) {
                AttemptError::retryable(error)
            } else {
                AttemptError::fatal(error)
            });
        }

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create scratch directory: {}",
                    self.scratch_dir.display()
                )
            })
            .map_err(AttemptError::local)?;

        let (std_file, path) = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .suffix(TEMP_FILE_SUFFIX)
            .tempfile_in(&self.scratch_dir)
            .with_context(|| {
                format!(
                    "failed to create temp file in {}",
                    self.scratch_dir.display()
                )
            })
            .map_err(AttemptError::local)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut size = 0u64;
        loop {
            // A body cut short surfaces as a decode error from the async client.
            let chunk = response.chunk().await.map_err(|err| {
                AttemptError::retryable(anyhow!(
                    "failed while reading HTTP body from {redacted}: {}",
                    err.without_url()
                ))
            })?;
            let Some(chunk) = chunk else {
                break;
            };

            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write temp file: {}", path.display()))
                .map_err(AttemptError::local)?;
            size += chunk.len() as u64;
        }

        file.flush()
            .await
            .with_context(|| format!("failed to flush temp file: {}", path.display()))
            .map_err(AttemptError::local)?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to fsync temp file: {}", path.display()))
            .map_err(AttemptError::local)?;
        drop(file);

        debug!(url = %redacted, path = %path.display(), size, "input image downloaded");
        Ok(FetchedImage { path, size })
    }
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed).with_context(|| {
        format!(
            "invalid input image URL: {}",
            crate::logging::redact_sensitive_text(trimmed)
        )
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => {
            let redacted = redacted_url_for_display(&parsed);
            bail!("unsupported input image URL scheme '{scheme}' for '{redacted}' (expected http/https)")
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Signed URLs carry their credentials in the query string; never show it.
pub fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    if redacted.query().is_some() {
        redacted.set_query(Some("<redacted>"));
    }
    if !redacted.username().is_empty() || redacted.password().is_some() {
        let _ = redacted.set_username("");
        let _ = redacted.set_password(None);
    }
    redacted.to_string()
}
