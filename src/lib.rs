//! Deployment service core: hands fleet machines a content-addressed
//! launcher manifest, uploads referenced files to central storage on demand,
//! and offloads downloads through deterministically-assigned peer proxies.
//!
//! The HTTP transport, the concrete vault client and the concrete object
//! store are injected collaborators; see [`SecretsProvider`],
//! [`CentralStorage`] and [`StorageFactory`].

mod cache;
mod clock;
mod config;
mod error;
mod hashing;
mod loader;
mod proxy;
mod queue;
mod secrets;
mod service;
mod storage;
mod upload;

pub use self::cache::{AsyncCache, LazyFuture, VolatileMap};
pub use self::clock::{Clock, SharedClock, SystemClock};
pub use self::config::{
    DeploymentConfiguration, DeploymentManifest, DeploymentParameters, DropConfiguration,
    FileSpec, HostParameters, LauncherManifest, ProxyConfiguration, ProxyServiceConfiguration,
    SecretConfiguration, ToolConfiguration, preprocess,
};
pub use self::error::{Result, ServiceError};
pub use self::hashing::{content_id, content_path};
pub use self::loader::{DEPLOYMENT_MANIFEST_FILE, LoadedDeployment, ManifestLoader};
pub use self::proxy::{ProxyManager, default_base_address};
pub use self::queue::ActionQueue;
pub use self::secrets::{SecretCache, SecretKind, SecretsProvider};
pub use self::service::{DeploymentService, ServiceOptions};
pub use self::storage::{
    CentralStorage, DEPLOYMENT_CONTAINER, StorageFactory, StorageRegistry,
};
pub use self::upload::{DownloadInfo, TokenRegistry, UploadCoordinator};
