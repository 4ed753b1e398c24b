//! Connected provider handles, one per client

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use homevault_core::domain::ClientId;
use homevault_core::ports::IProviderAdapter;

/// Provider handles of connected clients
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ClientId, Arc<dyn IProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the handle for `client`
    pub fn register(&self, client: ClientId, provider: Arc<dyn IProviderAdapter>) {
        debug!(client_id = %client, provider = provider.name(), "Provider registered");
        self.providers.insert(client, provider);
    }

    pub fn get(&self, client: &ClientId) -> Option<Arc<dyn IProviderAdapter>> {
        self.providers.get(client).map(|p| Arc::clone(p.value()))
    }

    pub fn remove(&self, client: &ClientId) -> Option<Arc<dyn IProviderAdapter>> {
        self.providers.remove(client).map(|(_, p)| p)
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.providers.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
