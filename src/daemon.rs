//! Explicit, constructible daemon state, replacing the reference implementation's
//! process-wide globals (`fnManager`, `vmController`, `ssManager`) with a struct
//! passed by reference into every entry point (§9 design note). Tests instantiate a
//! fresh `DaemonState` rather than relying on shared global mutable state.

use std::path::Path;
use std::sync::Arc;

use crate::config::{ConfigError, DaemonConfig};
use crate::controller::VmController;
use crate::function::FunctionCatalog;
use crate::network::NetworkRegistry;
use crate::process_spawner::ProcessSpawner;
use crate::supervisor::SubprocessSupervisor;

/// The assembled control plane: configuration plus the collaborators it was built
/// from, and the controller built on top of them.
pub struct DaemonState<S: ProcessSpawner> {
    pub config: Arc<DaemonConfig>,
    pub controller: Arc<VmController<S>>,
}

impl<S: ProcessSpawner> DaemonState<S> {
    /// Load configuration from `config_path` and assemble a `DaemonState` from it
    /// plus the injected external collaborators.
    pub async fn load(
        config_path: impl AsRef<Path>,
        networks: NetworkRegistry,
        functions: Arc<dyn FunctionCatalog>,
        process_spawner: Arc<S>,
    ) -> Result<Self, ConfigError> {
        let config = Arc::new(DaemonConfig::load(config_path).await?);
        Ok(Self::new(config, networks, functions, process_spawner))
    }

    /// Assemble a `DaemonState` directly from an already-loaded configuration.
    /// Primarily for tests, which want fresh state without touching the filesystem
    /// for configuration (they still exercise real subprocess/socket I/O).
    pub fn new(
        config: Arc<DaemonConfig>,
        networks: NetworkRegistry,
        functions: Arc<dyn FunctionCatalog>,
        process_spawner: Arc<S>,
    ) -> Self {
        let hypervisor_binary = config
            .executables
            .first()
            .cloned()
            .unwrap_or_else(|| std::path::PathBuf::from("firecracker"));
        let supervisor = Arc::new(SubprocessSupervisor::new(process_spawner, hypervisor_binary));
        let controller = Arc::new(VmController::new(Arc::clone(&config), Arc::new(networks), functions, supervisor));
        Self { config, controller }
    }
}
