use crate::cache::VolatileMap;
use crate::clock::SharedClock;
use crate::config::{HostParameters, ProxyConfiguration};
use crate::error::{Result, ServiceError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Machines of one `stamp + domain` epoch in discovery order. Indices are
/// stable for the lifetime of the epoch.
#[derive(Default)]
struct MachineIndex {
    order: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl MachineIndex {
    fn index_of(&mut self, machine: &str) -> usize {
        if let Some(&index) = self.by_name.get(machine) {
            return index;
        }
        let index = self.order.len();
        self.order.push(machine.to_string());
        self.by_name.insert(machine.to_string(), index);
        index
    }

    fn machine_at(&self, index: usize) -> Option<&str> {
        self.order.get(index).map(String::as_str)
    }
}

/// Deterministic fan-out assignment of caller machines to peer proxies.
///
/// Cohorts are drawn from machines with smaller indices, so newly-arriving
/// machines pull from established peers and the fleet forms a tree rooted
/// at the seeds. The whole index space is rebuilt when the epoch entry
/// expires, bounding topology drift after fleet churn.
pub struct ProxyManager {
    topologies: VolatileMap<String, Arc<Mutex<MachineIndex>>>,
}

impl ProxyManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            topologies: VolatileMap::new(clock),
        }
    }

    /// The proxy base address for a caller, or `None` when the caller is a
    /// seed and fetches straight from the object store.
    pub fn get_base_address(
        &self,
        params: &HostParameters,
        proxy: &ProxyConfiguration,
    ) -> Result<Option<String>> {
        let topology = self.topology(
            format!("{}{}", params.stamp, proxy.domain),
            proxy.service_configuration.proxy_address_time_to_live,
        );
        let mut index_guard = topology
            .lock()
            .map_err(|_| ServiceError::fatal("proxy topology lock poisoned"))?;

        let index = index_guard.index_of(&params.machine);
        if index < proxy.seeds {
            debug!("Machine {} is a seed (index {index})", params.machine);
            return Ok(None);
        }

        let fan_out = proxy.fan_out_factor.max(1);
        let lo = index / fan_out;
        let hi = index.min(lo + fan_out);
        if hi <= lo {
            // The cohort would contain only the machine itself; route through
            // the deployment service rather than create a self-loop.
            return default_base_address(proxy).map(Some);
        }

        let pick = rand::rng().random_range(lo..hi);
        let peer = index_guard
            .machine_at(pick)
            .ok_or_else(|| ServiceError::fatal(format!("no machine at proxy index {pick}")))?;
        Ok(Some(format!(
            "http://{peer}:{}/",
            proxy.service_configuration.port
        )))
    }

    fn topology(&self, key: String, ttl: Duration) -> Arc<Mutex<MachineIndex>> {
        if let Some(existing) = self.topologies.try_get(&key) {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(MachineIndex::default()));
        loop {
            if self.topologies.try_add(key.clone(), Arc::clone(&fresh), ttl) {
                return fresh;
            }
            if let Some(existing) = self.topologies.try_get(&key) {
                return existing;
            }
        }
    }
}

/// Proxy base of last resort: the deployment service itself, normalised to
/// end in a slash.
pub fn default_base_address(proxy: &ProxyConfiguration) -> Result<String> {
    let url = Url::parse(&proxy.service_configuration.deployment_service_url)
        .map_err(|err| ServiceError::malformed(format!("deploymentServiceUrl: {err}")))?;
    let mut base = url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(base)
}
