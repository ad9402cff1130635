use crate::cache::AsyncCache;
use crate::clock::SharedClock;
use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// External vault abstraction. Implementations fail with `NotFound`,
/// `Unauthorized` or `Transient`.
#[async_trait]
pub trait SecretsProvider: Send + Sync + 'static {
    async fn get_plain_secret(&self, name: &str, cancel: &CancellationToken) -> Result<String>;
}

/// How a named secret's vault value is interpreted once fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretKind {
    /// The vault value is returned verbatim.
    PlainText,
    /// The vault value is a storage account access key; it is rewritten
    /// into a full connection string.
    SasToken,
}

const SAS_SECRET_SUFFIX: &str = "-sas";
const CONNECTION_STRING_PREFIX: &str = "DefaultEndpointProtocol=";

/// Deduplicated, TTL-bound secret retrieval keyed by `(name, kind)`.
pub struct SecretCache {
    cache: AsyncCache<(String, SecretKind), String>,
}

impl SecretCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            cache: AsyncCache::new(clock),
        }
    }

    pub async fn get_secret(
        &self,
        cancel: &CancellationToken,
        provider: &Arc<dyn SecretsProvider>,
        name: &str,
        kind: SecretKind,
        ttl: Duration,
    ) -> Result<String> {
        // Validate the naming convention before anything is cached so a
        // misconfigured secret fails the same way every time.
        let account = match kind {
            SecretKind::PlainText => None,
            SecretKind::SasToken => Some(sas_account_name(name)?.to_string()),
        };

        let producer = {
            let provider = Arc::clone(provider);
            let cancel = cancel.clone();
            let name = name.to_string();
            async move {
                if cancel.is_cancelled() {
                    return Err(ServiceError::transient("secret resolution cancelled"));
                }
                debug!("Resolving secret {name} from the vault");
                let value = provider.get_plain_secret(&name, &cancel).await?;
                Ok(match account {
                    Some(account) => as_connection_string(&account, value),
                    None => value,
                })
            }
        };
        self.cache
            .get_or_insert((name.to_string(), kind), ttl, producer)
            .await
    }
}

/// The storage account a SAS secret belongs to: its name with the mandatory
/// (case-insensitive) `-sas` suffix removed.
fn sas_account_name(name: &str) -> Result<&str> {
    name.len()
        .checked_sub(SAS_SECRET_SUFFIX.len())
        .and_then(|cut| name.split_at_checked(cut))
        .filter(|(_, suffix)| suffix.eq_ignore_ascii_case(SAS_SECRET_SUFFIX))
        .map(|(account, _)| account)
        .ok_or_else(|| {
            ServiceError::malformed(format!(
                "storage secret name '{name}' must end in '{SAS_SECRET_SUFFIX}'"
            ))
        })
}

fn as_connection_string(account: &str, value: String) -> String {
    if value.starts_with(CONNECTION_STRING_PREFIX) {
        return value;
    }
    format!(
        "DefaultEndpointsProtocol=https;AccountName={account};AccountKey={value};EndpointSuffix=core.windows.net"
    )
}
