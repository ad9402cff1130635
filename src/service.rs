use crate::clock::{SharedClock, SystemClock};
use crate::config::{DeploymentParameters, FileSpec, LauncherManifest};
use crate::error::{Result, ServiceError};
use crate::hashing;
use crate::loader::{LoadedDeployment, ManifestLoader};
use crate::proxy::ProxyManager;
use crate::queue::ActionQueue;
use crate::secrets::{SecretCache, SecretKind, SecretsProvider};
use crate::storage::{StorageFactory, StorageRegistry};
use crate::upload::{DownloadInfo, TokenRegistry, UploadCoordinator};
use constant_time_eq::constant_time_eq;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wiring for a [`DeploymentService`].
pub struct ServiceOptions {
    pub deployment_root: PathBuf,
    /// Width of the upload pool.
    pub upload_concurrency: usize,
    pub clock: SharedClock,
}

impl ServiceOptions {
    pub fn new(deployment_root: impl Into<PathBuf>) -> Self {
        Self {
            deployment_root: deployment_root.into(),
            upload_concurrency: ActionQueue::DEFAULT_WIDTH,
            clock: Arc::new(SystemClock),
        }
    }
}

/// The service facade published to the transport layer: authorization,
/// launcher manifests, proxy addresses and token resolution.
///
/// All state lives process-wide in expirable caches; repeated client polling
/// against the same parameters is cheap.
pub struct DeploymentService {
    provider: Arc<dyn SecretsProvider>,
    secrets: Arc<SecretCache>,
    loader: ManifestLoader,
    storages: StorageRegistry,
    uploads: Arc<UploadCoordinator>,
    tokens: Arc<TokenRegistry>,
    proxies: ProxyManager,
}

impl DeploymentService {
    pub fn new(
        options: ServiceOptions,
        provider: Arc<dyn SecretsProvider>,
        storage_factory: StorageFactory,
    ) -> Self {
        let clock = options.clock;
        let secrets = Arc::new(SecretCache::new(Arc::clone(&clock)));
        let tokens = Arc::new(TokenRegistry::new(Arc::clone(&clock)));
        Self {
            provider,
            loader: ManifestLoader::new(options.deployment_root.clone(), Arc::clone(&clock)),
            storages: StorageRegistry::new(
                Arc::clone(&clock),
                Arc::clone(&secrets),
                storage_factory,
            ),
            uploads: Arc::new(UploadCoordinator::new(
                Arc::clone(&clock),
                options.deployment_root,
                options.upload_concurrency,
                Arc::clone(&tokens),
            )),
            proxies: ProxyManager::new(clock),
            secrets,
            tokens,
        }
    }

    /// True iff the caller's secret name is whitelisted by the deployment
    /// configuration and its value matches the vault. No detail about which
    /// check failed is leaked.
    pub async fn is_authorized(
        &self,
        cancel: &CancellationToken,
        params: &DeploymentParameters,
    ) -> Result<bool> {
        let loaded = self.loader.load(&params.host).await?;
        let config = loaded.configuration;
        if !config
            .authorization_secret_names
            .contains(&params.authorization_secret_name)
        {
            debug!(
                "Secret {} is not an allowed authorization secret",
                params.authorization_secret_name
            );
            return Ok(false);
        }
        let expected = self
            .secrets
            .get_secret(
                cancel,
                &self.provider,
                &params.authorization_secret_name,
                SecretKind::PlainText,
                config.authorization_secret_time_to_live,
            )
            .await?;
        Ok(constant_time_eq(
            expected.as_bytes(),
            params.authorization_secret.as_bytes(),
        ))
    }

    /// Builds the launcher manifest for one caller, ensuring every
    /// referenced file has a downloadable URL.
    ///
    /// With `wait_for_completion` the returned manifest is complete; without
    /// it, uploads still pending run on in the background and the partial
    /// view carries `is_complete = false` so the client polls again.
    pub async fn upload_files_and_get_manifest(
        &self,
        cancel: &CancellationToken,
        params: &DeploymentParameters,
        wait_for_completion: bool,
    ) -> Result<LauncherManifest> {
        let LoadedDeployment {
            manifest,
            configuration,
            mut content_id,
        } = self.loader.load(&params.host).await?;
        let config = Arc::new(configuration);

        let mut tool = config.tool.clone();
        if !tool.secret_environment_variables.is_empty() {
            for (key, secret) in &tool.secret_environment_variables {
                let name = secret.name.as_deref().unwrap_or(key);
                let value = self
                    .secrets
                    .get_secret(cancel, &self.provider, name, secret.kind, secret.time_to_live)
                    .await?;
                tool.environment_variables.insert(key.clone(), value);
                if secret.kind == SecretKind::SasToken {
                    tool.environment_variables
                        .insert(format!("{key}_ResourceType"), "storagekey".to_string());
                }
            }
            // The caller's view changes with the resolved values, so they
            // feed the content id as well.
            let env_json = serde_json::to_string(&tool.environment_variables)?;
            content_id = format!("{content_id}_{}", hashing::content_id(env_json.as_bytes()));
        }

        let mut launcher = LauncherManifest {
            content_id,
            tool,
            drops: config.drops.clone(),
            deployment: BTreeMap::new(),
            is_complete: true,
        };

        let mut entries: Vec<(String, FileSpec)> = Vec::new();
        for drop in &config.drops {
            let Some(url) = &drop.url else { continue };
            let files = manifest.drops.get(url).ok_or_else(|| {
                ServiceError::not_found(format!("drop '{url}' is not in the deployment manifest"))
            })?;
            for (name, file) in files {
                entries.push((
                    join_target_path(drop.target_relative_path.as_deref(), name),
                    file.clone(),
                ));
            }
        }
        if let Some(proxy) = &config.proxy {
            // Peer proxies serve from a local deployment and need the
            // preprocessed-configuration blob alongside the drops.
            entries.push((
                proxy.target_relative_path.clone(),
                manifest.configuration.clone(),
            ));
        }

        if params.get_content_info_only {
            for (target, mut file) in entries {
                file.download_url = None;
                launcher.deployment.insert(target, file);
            }
            return Ok(launcher);
        }

        let storage = self
            .storages
            .load_storage(cancel, &self.provider, &config.azure_storage_secret_info)
            .await?;
        let proxy_base = match &config.proxy {
            Some(proxy) => self.proxies.get_base_address(&params.host, proxy)?,
            None => None,
        };
        let account = config.azure_storage_secret_info.resolved_name()?.to_string();

        if wait_for_completion {
            let storage = &storage;
            let config = &config;
            let proxy_base = proxy_base.as_deref();
            let results =
                futures::future::try_join_all(entries.into_iter().map(|(target, file)| {
                    async move {
                        let info = self
                            .uploads
                            .ensure_uploaded(cancel, &file, config, storage)
                            .await?;
                        Ok::<_, ServiceError>((target, finalized(file, info, proxy_base)))
                    }
                }))
                .await?;
            for (target, file) in results {
                launcher.deployment.insert(target, file);
            }
        } else {
            let mut pending = 0usize;
            for (target, file) in entries {
                if let Some(info) = self.uploads.peek(&account, &file.hash) {
                    launcher
                        .deployment
                        .insert(target, finalized(file, info, proxy_base.as_deref()));
                    continue;
                }
                pending += 1;
                let uploads = Arc::clone(&self.uploads);
                let storage = Arc::clone(&storage);
                let config = Arc::clone(&config);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = uploads
                        .ensure_uploaded(&cancel, &file, &config, &storage)
                        .await
                    {
                        debug!("Background upload of {} failed: {err}", file.hash);
                    }
                });
            }
            launcher.is_complete = pending == 0;
        }
        Ok(launcher)
    }

    /// The proxy base address a caller should route content through, or
    /// `None` when no proxy is configured or the caller is a seed.
    pub async fn get_proxy_base_address(
        &self,
        params: &DeploymentParameters,
    ) -> Result<Option<String>> {
        let loaded = self.loader.load(&params.host).await?;
        match &loaded.configuration.proxy {
            Some(proxy) => self.proxies.get_base_address(&params.host, proxy),
            None => Ok(None),
        }
    }

    /// Resolves a proxy access token to the real signed URL. Unknown and
    /// expired tokens are `Unauthorized`.
    pub fn try_get_download_url(&self, token: &str) -> Result<String> {
        self.tokens.try_get_download_url(token)
    }
}

fn finalized(mut file: FileSpec, info: DownloadInfo, proxy_base: Option<&str>) -> FileSpec {
    file.download_url = Some(match proxy_base {
        Some(base) => format!(
            "{base}content?hash={}&token={}",
            file.hash, info.access_token
        ),
        None => info.download_url,
    });
    file
}

fn join_target_path(directory: Option<&str>, name: &str) -> String {
    match directory.map(|dir| dir.trim_matches('/')) {
        Some(dir) if !dir.is_empty() => format!("{dir}/{name}"),
        _ => name.to_string(),
    }
}
