use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, RpcError};
use crate::registry;

/// How an endpoint is picked from the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly at random.
    Random,
    /// `servers[index % n]`, then advance.
    RoundRobin,
}

/// Endpoint list provider and selector for the multi-endpoint client.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-fetch the endpoint list from its source, if it has one.
    async fn refresh(&self) -> Result<()>;
    /// Replace the endpoint list.
    async fn update(&self, servers: Vec<String>) -> Result<()>;
    /// Select one endpoint according to `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String>;
    /// All endpoints, as a defensive copy.
    async fn get_all(&self) -> Result<Vec<String>>;
}

/// Discovery over a caller-supplied endpoint list, no registry involved.
pub struct MultiServerDiscovery {
    state: RwLock<DiscoveryState>,
}

struct DiscoveryState {
    servers: Vec<String>,
    /// Round-robin cursor. Seeded randomly so restarts do not all hammer
    /// the same first endpoint.
    index: usize,
    rng: StdRng,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        let index = rng.gen_range(0..u32::MAX as usize);
        MultiServerDiscovery {
            state: RwLock::new(DiscoveryState {
                servers,
                index,
                rng,
            }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<()> {
        // Nothing to refresh from: the list is caller-supplied.
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.state.write().unwrap().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.write().unwrap();
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::Discovery("no available servers".to_string()));
        }
        match mode {
            SelectMode::Random => {
                let pick = state.rng.gen_range(0..n);
                Ok(state.servers[pick].clone())
            }
            SelectMode::RoundRobin => {
                let pick = state.index % n;
                state.index = (state.index + 1) % n;
                Ok(state.servers[pick].clone())
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.read().unwrap().servers.clone())
    }
}

/// Default staleness bound for registry-backed discovery.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by the HTTP registry: the endpoint list is refreshed
/// lazily from the registry whenever it is older than the update timeout.
pub struct RegistryDiscovery {
    registry: String,
    servers: MultiServerDiscovery,
    update_timeout: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// `registry` is the full registry URL, e.g.
    /// `"http://127.0.0.1:9999/_geerpc_/registry"`. A zero
    /// `update_timeout` selects the default.
    pub fn new(registry: impl Into<String>, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        RegistryDiscovery {
            registry: registry.into(),
            servers: MultiServerDiscovery::new(Vec::new()),
            update_timeout,
            last_update: Mutex::new(None),
        }
    }

    async fn ensure_fresh(&self) -> Result<()> {
        let stale = match *self.last_update.lock().unwrap() {
            Some(at) => at.elapsed() > self.update_timeout,
            None => true,
        };
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }

    fn mark_updated(&self) {
        *self.last_update.lock().unwrap() = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        let servers = registry::fetch_servers(&self.registry).await?;
        tracing::debug!(registry = %self.registry, count = servers.len(), "refreshed server list");
        self.servers.update(servers).await?;
        self.mark_updated();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.update(servers).await?;
        self.mark_updated();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.ensure_fresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.ensure_fresh().await?;
        self.servers.get_all().await
    }
}
