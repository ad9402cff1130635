use crate::cache::AsyncCache;
use crate::clock::SharedClock;
use crate::config::{self, DeploymentConfiguration, DeploymentManifest, HostParameters};
use crate::error::{Result, ServiceError};
use crate::hashing;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};

pub const DEPLOYMENT_MANIFEST_FILE: &str = "DeploymentManifest.json";

const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// What one caller sees after preprocessing the shared configuration.
#[derive(Debug, Clone)]
pub struct LoadedDeployment {
    pub manifest: Arc<DeploymentManifest>,
    pub configuration: DeploymentConfiguration,
    /// Murmur digest of the preprocessed configuration text.
    pub content_id: String,
}

/// The manifest and raw configuration read from disk, shared by every
/// request in the current cache epoch.
#[derive(Clone)]
struct RawDeployment {
    manifest: Arc<DeploymentManifest>,
    config_json: Arc<str>,
}

/// Reads the deployment manifest and configuration blob from the deployment
/// root, preprocesses the configuration for one caller, and derives its
/// content id.
pub struct ManifestLoader {
    root: PathBuf,
    cache: AsyncCache<(), RawDeployment>,
}

impl ManifestLoader {
    pub fn new(root: PathBuf, clock: SharedClock) -> Self {
        Self {
            root,
            cache: AsyncCache::new(clock),
        }
    }

    pub fn deployment_root(&self) -> &Path {
        &self.root
    }

    pub async fn load(&self, params: &HostParameters) -> Result<LoadedDeployment> {
        let raw = self.raw_deployment().await?;
        let preprocessed = config::preprocess(&raw.config_json, params)?;
        let content_id = hashing::content_id(preprocessed.as_bytes());
        let configuration: DeploymentConfiguration = serde_json::from_str(&preprocessed)
            .map_err(|err| {
                ServiceError::malformed(format!("deployment configuration: {err}"))
            })?;
        Ok(LoadedDeployment {
            manifest: raw.manifest,
            configuration,
            content_id,
        })
    }

    async fn raw_deployment(&self) -> Result<RawDeployment> {
        let root = self.root.clone();
        self.cache
            .get_or_insert((), MANIFEST_CACHE_TTL, async move {
                let manifest_path = root.join(DEPLOYMENT_MANIFEST_FILE);
                debug!("Reading deployment manifest from {}", manifest_path.display());
                let manifest_json = read_file(&manifest_path).await?;
                let manifest: DeploymentManifest = serde_json::from_str(&manifest_json)
                    .map_err(|err| {
                        ServiceError::malformed(format!("{DEPLOYMENT_MANIFEST_FILE}: {err}"))
                    })?;

                let config_relative = hashing::content_path(&manifest.configuration.hash)?;
                let config_json = read_file(&root.join(&config_relative)).await?;
                info!(
                    "Loaded deployment manifest: {} drops, configuration {}",
                    manifest.drops.len(),
                    manifest.configuration.hash
                );
                Ok(RawDeployment {
                    manifest: Arc::new(manifest),
                    config_json: Arc::from(config_json),
                })
            })
            .await
    }
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|err| {
        let detail = format!("{}: {err}", path.display());
        match err.kind() {
            std::io::ErrorKind::NotFound => ServiceError::NotFound(detail),
            _ => ServiceError::Transient(detail),
        }
    })
}
