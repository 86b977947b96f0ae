//! Downloads the weight bundles from the Hugging Face hub.
//!
//! Files are fetched through the hub cache, then each cached blob is moved
//! into the bundle directory and its snapshot link removed, so every weight
//! file exists on disk once. A bundle is assembled in `<dir>.partial` and
//! renamed into place once complete, so an interrupted fetch never leaves a
//! populated-looking directory behind.

use std::path::{Component, Path, PathBuf};

use hf_hub::api::tokio::{Api, ApiBuilder, ApiError};
use hf_hub::Repo;
use thiserror::Error;
use tracing::{info, warn};

use crate::weights::dir_is_populated;
use crate::{ServiceConfig, WeightBundle};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("hub request for {repo} failed: {source}")]
    Hub {
        repo: String,
        #[source]
        source: ApiError,
    },
    #[error("failed to build hub client: {0}")]
    Client(#[source] ApiError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Skipped,
    Downloaded { files: usize },
}

pub struct WeightFetcher {
    api: Api,
    weights_dir: PathBuf,
}

impl WeightFetcher {
    /// Builds a hub client that caches under the configured hub cache.
    /// `token` is only needed for gated repositories.
    pub fn new(config: &ServiceConfig, token: Option<String>) -> Result<Self, FetchError> {
        let api = ApiBuilder::new()
            .with_cache_dir(config.hub_cache.clone())
            .with_token(token)
            .with_progress(true)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            api,
            weights_dir: config.weights_dir.clone(),
        })
    }

    pub fn bundle_dir(&self, bundle: WeightBundle) -> PathBuf {
        self.weights_dir.join(bundle.dir_name())
    }

    pub async fn fetch_all(&self) -> Result<Vec<(WeightBundle, FetchStatus)>, FetchError> {
        info!("weights dir: {}", self.weights_dir.display());
        let mut report = Vec::with_capacity(WeightBundle::ALL.len());
        for bundle in WeightBundle::ALL {
            let status = self.fetch(bundle).await?;
            report.push((bundle, status));
        }
        Ok(report)
    }

    pub async fn fetch(&self, bundle: WeightBundle) -> Result<FetchStatus, FetchError> {
        let target = self.bundle_dir(bundle);
        if dir_is_populated(&target) {
            info!("skipping {}: already present at {}", bundle.repo_id(), target.display());
            return Ok(FetchStatus::Skipped);
        }

        info!("downloading {} -> {}", bundle.repo_id(), target.display());
        let hub_err = |source: ApiError| FetchError::Hub {
            repo: bundle.repo_id().to_string(),
            source,
        };
        let repo = self.api.repo(Repo::model(bundle.repo_id().to_string()));
        let repo_info = repo.info().await.map_err(hub_err)?;

        let partial = self.weights_dir.join(format!("{}.partial", bundle.dir_name()));
        if partial.exists() {
            tokio::fs::remove_dir_all(&partial)
                .await
                .map_err(|source| io_err(&partial, source))?;
        }

        let mut files = 0;
        for sibling in &repo_info.siblings {
            let Some(dest) = local_path(&partial, &sibling.rfilename) else {
                warn!("skipping suspicious repo path {:?}", sibling.rfilename);
                continue;
            };
            let cached = repo.get(&sibling.rfilename).await.map_err(hub_err)?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| io_err(parent, source))?;
            }
            move_from_cache(&cached, &dest)
                .await
                .map_err(|source| io_err(&dest, source))?;
            files += 1;
        }

        if target.exists() {
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|source| io_err(&target, source))?;
        }
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|source| io_err(&target, source))?;

        info!("fetched {} files for {}", files, bundle.repo_id());
        Ok(FetchStatus::Downloaded { files })
    }
}

/// Moves the blob behind the cache entry `cached` to `dest`, then drops the
/// entry itself when it was a link. Falls back to copy and delete when the
/// cache sits on another filesystem.
async fn move_from_cache(cached: &Path, dest: &Path) -> std::io::Result<()> {
    let blob = tokio::fs::canonicalize(cached).await?;
    if tokio::fs::rename(&blob, dest).await.is_err() {
        tokio::fs::copy(&blob, dest).await?;
        tokio::fs::remove_file(&blob).await?;
    }
    if blob != cached {
        match tokio::fs::remove_file(cached).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Maps a repo-relative file name under `root`, refusing anything that
/// would escape it.
fn local_path(root: &Path, rfilename: &str) -> Option<PathBuf> {
    let relative = Path::new(rfilename);
    let mut components = relative.components().peekable();
    if components.peek().is_some()
        && components.all(|component| matches!(component, Component::Normal(_)))
    {
        Some(root.join(relative))
    } else {
        None
    }
}
