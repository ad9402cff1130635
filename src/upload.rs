use crate::cache::{AsyncCache, VolatileMap};
use crate::clock::SharedClock;
use crate::config::{DeploymentConfiguration, FileSpec};
use crate::error::{Result, ServiceError};
use crate::hashing;
use crate::queue::ActionQueue;
use crate::storage::CentralStorage;
use rand::Rng;
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A minted download URL plus the short-lived token a peer proxy presents
/// to resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    pub download_url: String,
    pub access_token: String,
}

/// Maps access tokens to the real signed URLs for proxied retrieval.
///
/// Unknown and expired tokens are indistinguishable to the caller: both are
/// `Unauthorized`, leaking nothing about which tokens ever existed.
pub struct TokenRegistry {
    tokens: VolatileMap<String, String>,
}

impl TokenRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            tokens: VolatileMap::new(clock),
        }
    }

    pub fn register(&self, token: String, download_url: String, ttl: Duration) {
        self.tokens.try_add(token, download_url, ttl);
    }

    pub fn try_get_download_url(&self, token: &str) -> Result<String> {
        self.tokens
            .try_get(token)
            .ok_or(ServiceError::Unauthorized)
    }
}

/// Ensures files are present in central storage and yields their download
/// URLs: at most one upload per `(account, hash)` per TTL epoch, with total
/// upload parallelism bounded by the action queue.
pub struct UploadCoordinator {
    clock: SharedClock,
    root: PathBuf,
    queue: Arc<ActionQueue>,
    tokens: Arc<TokenRegistry>,
    cache: AsyncCache<(String, String), DownloadInfo>,
}

impl UploadCoordinator {
    pub fn new(
        clock: SharedClock,
        root: PathBuf,
        queue_width: usize,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        Self {
            cache: AsyncCache::new(Arc::clone(&clock)),
            clock,
            root,
            queue: Arc::new(ActionQueue::new(queue_width)),
            tokens,
        }
    }

    /// The completed download for `(account, hash)`, if one is already
    /// cached this epoch. Never touches the queue.
    pub fn peek(&self, account: &str, hash: &str) -> Option<DownloadInfo> {
        self.cache.peek(&(account.to_string(), hash.to_string()))
    }

    pub async fn ensure_uploaded(
        &self,
        cancel: &CancellationToken,
        file: &FileSpec,
        config: &DeploymentConfiguration,
        storage: &Arc<dyn CentralStorage>,
    ) -> Result<DownloadInfo> {
        let account = config.azure_storage_secret_info.resolved_name()?.to_string();
        let sas_ttl = config.sas_url_time_to_live;

        let producer = {
            let clock = Arc::clone(&self.clock);
            let root = self.root.clone();
            let queue = Arc::clone(&self.queue);
            let tokens = Arc::clone(&self.tokens);
            let storage = Arc::clone(storage);
            let cancel = cancel.clone();
            let hash = file.hash.clone();
            async move {
                queue
                    .run(provide_download(
                        clock, root, tokens, storage, cancel, hash, sas_ttl,
                    ))
                    .await
            }
        };
        self.cache
            .get_or_insert((account, file.hash.clone()), sas_ttl, producer)
            .await
    }
}

async fn provide_download(
    clock: SharedClock,
    root: PathBuf,
    tokens: Arc<TokenRegistry>,
    storage: Arc<dyn CentralStorage>,
    cancel: CancellationToken,
    hash: String,
    sas_ttl: Duration,
) -> Result<DownloadInfo> {
    if cancel.is_cancelled() {
        return Err(ServiceError::transient("upload cancelled"));
    }
    let relative = hashing::content_path(&hash)?;
    // Issued for twice the cache TTL, so a hit served at the very end of the
    // epoch still has a full TTL of validity left.
    let expiry: SystemTime = clock.utc_now() + sas_ttl * 2;

    let download_url = match storage.try_get_sas_url(&cancel, &relative, expiry).await? {
        Some(url) => {
            debug!("Content {hash} already present in central storage");
            url
        }
        None => {
            info!("Uploading {hash} to central storage");
            storage
                .upload_file(&cancel, &root.join(&relative), &relative)
                .await?;
            storage
                .try_get_sas_url(&cancel, &relative, expiry)
                .await?
                .ok_or_else(|| {
                    ServiceError::transient(format!("no download url for {hash} after upload"))
                })?
        }
    };

    let access_token = random_access_token();
    // The token strictly outlives the cached URL's effective lifetime.
    tokens.register(
        access_token.clone(),
        download_url.clone(),
        sas_ttl + sas_ttl / 2,
    );
    Ok(DownloadInfo {
        download_url,
        access_token,
    })
}

/// 32 hex characters of fresh randomness.
fn random_access_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
