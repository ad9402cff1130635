use crate::cache::AsyncCache;
use crate::clock::SharedClock;
use crate::config::SecretConfiguration;
use crate::error::Result;
use crate::secrets::{SecretCache, SecretsProvider};
use async_trait::async_trait;
use std::{path::Path, sync::Arc, time::SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Container every deployment file lands in, regardless of account.
pub const DEPLOYMENT_CONTAINER: &str = "deploymentfiles";

/// External object-store abstraction.
#[async_trait]
pub trait CentralStorage: Send + Sync + 'static {
    async fn startup(&self, cancel: &CancellationToken) -> Result<()>;

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()>;

    /// A time-limited download URL for `remote_path`, or `Ok(None)` when
    /// the object is not present. Any other failure is an error.
    async fn try_get_sas_url(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        expiry: SystemTime,
    ) -> Result<Option<String>>;
}

/// Constructor seam: receives the resolved connection string and the
/// container name, returns a ready-to-start client. Tests and the external
/// wiring decide the concrete implementation.
pub type StorageFactory = Arc<dyn Fn(&str, &str) -> Result<Arc<dyn CentralStorage>> + Send + Sync>;

/// Opens and caches one [`CentralStorage`] per storage secret name.
pub struct StorageRegistry {
    cache: AsyncCache<String, Arc<dyn CentralStorage>>,
    secrets: Arc<SecretCache>,
    factory: StorageFactory,
}

impl StorageRegistry {
    pub fn new(clock: SharedClock, secrets: Arc<SecretCache>, factory: StorageFactory) -> Self {
        Self {
            cache: AsyncCache::new(clock),
            secrets,
            factory,
        }
    }

    pub async fn load_storage(
        &self,
        cancel: &CancellationToken,
        provider: &Arc<dyn SecretsProvider>,
        secret_info: &SecretConfiguration,
    ) -> Result<Arc<dyn CentralStorage>> {
        let name = secret_info.resolved_name()?.to_string();
        let ttl = secret_info.time_to_live;
        let kind = secret_info.kind;

        let producer = {
            let secrets = Arc::clone(&self.secrets);
            let provider = Arc::clone(provider);
            let factory = Arc::clone(&self.factory);
            let cancel = cancel.clone();
            let name = name.clone();
            async move {
                let connection = secrets
                    .get_secret(&cancel, &provider, &name, kind, ttl)
                    .await?;
                let storage = (factory)(&connection, DEPLOYMENT_CONTAINER)?;
                storage.startup(&cancel).await?;
                info!("Opened central storage for secret {name}");
                Ok(storage)
            }
        };
        self.cache.get_or_insert(name, ttl, producer).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ServiceError;
    use crate::secrets::SecretKind;
    use crate::secrets::tests::MemorySecretsProvider;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, UNIX_EPOCH};

    /// In-memory object store standing in for the injected client.
    pub(crate) struct MemoryStorage {
        account: String,
        objects: DashMap<String, Vec<u8>>,
        startups: AtomicUsize,
        uploads: AtomicUsize,
    }

    impl MemoryStorage {
        pub(crate) fn new(connection_string: &str) -> Arc<Self> {
            Arc::new(Self {
                account: connection_string
                    .split(';')
                    .find_map(|part| part.strip_prefix("AccountName="))
                    .unwrap_or("unknown")
                    .to_string(),
                objects: DashMap::new(),
                startups: AtomicUsize::new(0),
                uploads: AtomicUsize::new(0),
            })
        }

        pub(crate) fn put_object(&self, remote_path: &str, bytes: &[u8]) {
            self.objects.insert(remote_path.to_string(), bytes.to_vec());
        }

        pub(crate) fn startups(&self) -> usize {
            self.startups.load(Ordering::SeqCst)
        }

        pub(crate) fn uploads(&self) -> usize {
            self.uploads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CentralStorage for MemoryStorage {
        async fn startup(&self, _cancel: &CancellationToken) -> Result<()> {
            self.startups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn upload_file(
            &self,
            _cancel: &CancellationToken,
            local_path: &Path,
            remote_path: &str,
        ) -> Result<()> {
            let bytes = tokio::fs::read(local_path).await?;
            self.uploads.fetch_add(1, Ordering::SeqCst);
            self.objects.insert(remote_path.to_string(), bytes);
            Ok(())
        }

        async fn try_get_sas_url(
            &self,
            _cancel: &CancellationToken,
            remote_path: &str,
            expiry: SystemTime,
        ) -> Result<Option<String>> {
            if !self.objects.contains_key(remote_path) {
                return Ok(None);
            }
            let expiry_secs = expiry
                .duration_since(UNIX_EPOCH)
                .map_err(|_| ServiceError::fatal("sas expiry before epoch"))?
                .as_secs();
            Ok(Some(format!(
                "https://{}.blob.example/{DEPLOYMENT_CONTAINER}/{remote_path}?sv=fake&se={expiry_secs}",
                self.account
            )))
        }
    }

    fn secret_info(name: &str) -> SecretConfiguration {
        SecretConfiguration {
            name: Some(name.to_string()),
            time_to_live: Duration::from_secs(1800),
            kind: SecretKind::SasToken,
        }
    }

    #[tokio::test]
    async fn storage_is_opened_once_per_secret_name() {
        let clock = ManualClock::new();
        let secrets = Arc::new(SecretCache::new(clock.clone()));
        let constructions = Arc::new(AtomicUsize::new(0));
        let factory: StorageFactory = {
            let constructions = Arc::clone(&constructions);
            Arc::new(move |connection, _container| {
                constructions.fetch_add(1, Ordering::SeqCst);
                Ok(MemoryStorage::new(connection) as Arc<dyn CentralStorage>)
            })
        };
        let registry = StorageRegistry::new(clock, secrets, factory);
        let provider: Arc<dyn SecretsProvider> =
            MemorySecretsProvider::new(&[("store-sas", "KEY")]);
        let cancel = CancellationToken::new();

        let first = registry
            .load_storage(&cancel, &provider, &secret_info("store-sas"))
            .await
            .unwrap();
        let second = registry
            .load_storage(&cancel, &provider, &secret_info("store-sas"))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nameless_secret_info_is_rejected() {
        let clock = ManualClock::new();
        let secrets = Arc::new(SecretCache::new(clock.clone()));
        let factory: StorageFactory =
            Arc::new(|connection, _| Ok(MemoryStorage::new(connection) as Arc<dyn CentralStorage>));
        let registry = StorageRegistry::new(clock, secrets, factory);
        let provider: Arc<dyn SecretsProvider> = MemorySecretsProvider::new(&[]);

        let result = registry
            .load_storage(
                &CancellationToken::new(),
                &provider,
                &SecretConfiguration {
                    name: None,
                    time_to_live: Duration::from_secs(60),
                    kind: SecretKind::SasToken,
                },
            )
            .await;
        match result {
            Err(err) => assert!(matches!(err, ServiceError::Malformed(_))),
            Ok(_) => panic!("expected malformed secret configuration to be rejected"),
        }
    }
}
