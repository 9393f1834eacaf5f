//! Shared state handed to every request handler.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::registry::{Registry, RegistryPaths};

/// GlobalConfig and the Registry are shared by all request handlers; every
/// other entity in the data model is owned by a single request.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Immutable-after-load process configuration.
    pub cfg: Arc<GlobalConfig>,
    /// The hot-reloadable registry.
    pub registry: Registry,
    /// On-disk paths the registry persists to / reloads from.
    pub paths: RegistryPaths,
}

impl AppState {
    /// Build application state from a loaded config and an initial registry table.
    pub fn new(cfg: GlobalConfig, registry: Registry, paths: RegistryPaths) -> Self {
        AppState {
            cfg: Arc::new(cfg),
            registry,
            paths,
        }
    }
}
