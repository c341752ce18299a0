//! Process-wide shared state.

use crate::channels::ChannelLayer;
use crate::conferencing::ConferencingService;
use crate::config::Config;
use crate::errors::LiveError;
use crate::modules::ModuleRegistry;
use crate::observability::HealthState;
use crate::registry::ConnectionRegistry;
use crate::repositories::Repository;
use crate::store::{SharedStore, StoreError};
use std::sync::Arc;

/// Everything a connection needs, built once at startup and read-only
/// afterwards.
pub struct AppState {
    pub config: Config,
    pub repository: Arc<dyn Repository>,
    pub layer: ChannelLayer,
    pub registry: ConnectionRegistry,
    pub modules: ModuleRegistry,
    pub conferencing: ConferencingService,
    pub health: Arc<HealthState>,
}

impl AppState {
    /// Wire up the state over connected store shards.
    ///
    /// The connection registry lives on the first shard.
    ///
    /// # Errors
    ///
    /// - `LiveError::Store` if `shards` is empty
    /// - `LiveError::Config` if the module registry has conflicting handlers
    /// - `LiveError::Internal` if the HTTP client cannot be built
    pub fn new(
        config: Config,
        repository: Arc<dyn Repository>,
        shards: Vec<Arc<dyn SharedStore>>,
    ) -> Result<Self, LiveError> {
        let registry_store = shards.first().cloned().ok_or(StoreError::NoShards)?;
        let registry = ConnectionRegistry::new(registry_store, config.connection_label());
        let layer = ChannelLayer::new(shards, config.channel_prefix.clone(), config.group_expiry())?;
        let modules =
            ModuleRegistry::standard().map_err(|e| LiveError::Config(e.to_string()))?;
        let conferencing = ConferencingService::new(repository.clone(), config.external_timeout())?;

        Ok(Self {
            config,
            repository,
            layer,
            registry,
            modules,
            conferencing,
            health: Arc::new(HealthState::new()),
        })
    }
}
