//! One generation request end to end: fetch the input image, run the
//! pipeline, pick up the artifact and publish it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::fetch::{FetchError, ImageFetcher};
use crate::output::{clear_directory, find_artifact};
use crate::pipeline::Pipeline;
use crate::storage::{ObjectStore, StoredObject};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Failed to download input image: {0:#}")]
    Fetch(anyhow::Error),
    #[error("generation pipeline failed: {0:#}")]
    Pipeline(anyhow::Error),
    #[error("Generation failed. No output file found.")]
    NoOutput { dir: PathBuf, pattern: String },
    #[error("failed to upload generated video: {0:#}")]
    Storage(anyhow::Error),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl From<FetchError> for GenerationError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Remote(inner) => Self::Fetch(inner),
            FetchError::Local(inner) => Self::Internal(inner),
        }
    }
}

pub struct Generator {
    fetcher: ImageFetcher,
    pipeline: Arc<dyn Pipeline>,
    store: Arc<dyn ObjectStore>,
    output_dir: PathBuf,
    output_prefix: String,
    output_extension: String,
    // The pipeline writes into one shared directory, so only one run at a time.
    permit: Semaphore,
}

impl Generator {
    pub fn new(
        config: &AppConfig,
        pipeline: Arc<dyn Pipeline>,
        store: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: ImageFetcher::new(&config.download)?,
            pipeline,
            store,
            output_dir: config.pipeline.output_dir.clone(),
            output_prefix: config.pipeline.output_prefix.clone(),
            output_extension: config.pipeline.output_extension.clone(),
            permit: Semaphore::new(1),
        })
    }

    pub async fn generate(
        &self,
        image_url: &str,
        bucket: &str,
    ) -> Result<StoredObject, GenerationError> {
        let _permit = self
            .permit
            .acquire()
            .await
            .context("generation queue closed")
            .map_err(GenerationError::Internal)?;
        let started = Instant::now();
        let _output_guard = OutputDirGuard(&self.output_dir);

        let input = self.fetcher.fetch(image_url).await?;
        info!(
            path = %input.path().display(),
            size = input.size(),
            "Input image saved"
        );

        let output_dir = self.output_dir.clone();
        tokio::task::spawn_blocking(move || clear_directory(&output_dir))
            .await
            .context("output directory cleanup task failed")
            .map_err(GenerationError::Internal)?;

        self.pipeline
            .run(input.path(), &self.output_prefix)
            .await
            .map_err(GenerationError::Pipeline)?;

        let artifact = find_artifact(&self.output_dir, &self.output_prefix, &self.output_extension)
            .map_err(GenerationError::Internal)?
            .ok_or_else(|| GenerationError::NoOutput {
                dir: self.output_dir.clone(),
                pattern: format!("{}_*.{}", self.output_prefix, self.output_extension),
            })?;

        let object_name = artifact
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| format!("artifact name is not valid UTF-8: {}", artifact.display()))
            .map_err(GenerationError::Internal)?;
        info!(artifact = %artifact.display(), "Found generated video");

        let stored = self
            .store
            .upload_file(bucket, &object_name, &artifact)
            .await
            .map_err(GenerationError::Storage)?;

        let input_path = input.path().to_path_buf();
        if let Err(err) = input.close() {
            warn!(path = %input_path.display(), error = %err, "Failed to remove input image");
        }

        info!(
            url = %stored.public_url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation complete"
        );
        Ok(stored)
    }
}

/// Empties the output directory when the request is over, however it ended.
struct OutputDirGuard<'a>(&'a Path);

impl Drop for OutputDirGuard<'_> {
    fn drop(&mut self) {
        clear_directory(self.0);
    }
}
