//! Per-seedbed registration state.
//!
//! The registry maps seedbed names to entries. Each entry owns the seedbed's
//! configuration, its one-time configuration function, and the map of
//! registered remote functions. The entry's async lock serialises the
//! configuration run and the deployed-check/provision sequence; it is not
//! held across bundle assembly or dispatch, so independent dispatches
//! proceed in parallel once the seedbed is known to exist.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard};

use crate::config::SeedbedConfig;
use crate::function::RemoteFunction;
use crate::invocation::FunctionId;
use crate::seedbed::SeedbedOutputs;

/// One-time configuration function applied to a seedbed's configuration.
pub type ConfigureFn = Box<dyn FnOnce(&mut SeedbedConfig) + Send + Sync>;

/// Mutable state of a registry entry, guarded by the entry lock.
pub struct EntryState {
    configured: bool,
    config_function: Option<ConfigureFn>,
    /// Seedbed configuration read by every dispatch.
    pub config: SeedbedConfig,
    /// Whether a missing seedbed is provisioned on demand.
    pub deploy_if_not_exists: bool,
    /// Outputs resolved by the most recent dispatch. Informational only;
    /// resolution runs again on every dispatch because seedbeds can change
    /// concurrently.
    pub outputs: Option<SeedbedOutputs>,
}

impl std::fmt::Debug for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryState")
            .field("configured", &self.configured)
            .field("has_config_function", &self.config_function.is_some())
            .field("deploy_if_not_exists", &self.deploy_if_not_exists)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl EntryState {
    fn new(config_function: Option<ConfigureFn>, deploy_if_not_exists: bool) -> Self {
        Self {
            configured: false,
            config_function,
            config: SeedbedConfig::default(),
            deploy_if_not_exists,
            outputs: None,
        }
    }

    /// Returns `true` once the configuration function has run (or was never
    /// registered).
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.configured
    }

    /// Runs the configuration function if it has not run yet.
    ///
    /// The function is consumed on first use; callers must hold the entry
    /// lock, which makes the run exactly-once per process lifetime.
    pub fn ensure_configured(&mut self) {
        if self.configured {
            return;
        }
        if let Some(configure) = self.config_function.take() {
            configure(&mut self.config);
            tracing::info!("seedbed configuration complete");
        }
        self.configured = true;
    }
}

/// Registration state for one named seedbed.
pub struct RegistryEntry<P> {
    name: String,
    state: Mutex<EntryState>,
    functions: StdMutex<BTreeMap<String, Arc<RemoteFunction<P>>>>,
}

impl<P> std::fmt::Debug for RegistryEntry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<P> RegistryEntry<P> {
    fn new(name: &str, config_function: Option<ConfigureFn>, deploy_if_not_exists: bool) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(EntryState::new(config_function, deploy_if_not_exists)),
            functions: StdMutex::new(BTreeMap::new()),
        }
    }

    /// Returns the seedbed name this entry belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the entry lock, waiting for any in-flight configuration or
    /// provisioning sequence to finish.
    pub async fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().await
    }

    /// Records a wrapper under its identifier; the last registration wins.
    pub fn record_function(&self, fn_id: &FunctionId, wrapper: Arc<RemoteFunction<P>>) {
        self.functions_lock().insert(fn_id.to_string(), wrapper);
    }

    /// Returns the wrapper registered under `fn_id`, if any.
    #[must_use]
    pub fn function(&self, fn_id: &FunctionId) -> Option<Arc<RemoteFunction<P>>> {
        self.functions_lock().get(&fn_id.to_string()).cloned()
    }

    /// Returns the registered identifiers in sorted order.
    #[must_use]
    pub fn function_ids(&self) -> Vec<String> {
        self.functions_lock().keys().cloned().collect()
    }

    fn functions_lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<RemoteFunction<P>>>> {
        self.functions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Process-wide mapping from seedbed name to registration state.
///
/// Owned by the orchestrator instance rather than living in a static so the
/// lifecycle is explicit: empty at construction, populated as functions are
/// registered, never pruned before the owner is dropped.
pub struct Registry<P> {
    entries: StdMutex<BTreeMap<String, Arc<RegistryEntry<P>>>>,
}

impl<P> std::fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("seedbeds", &self.names())
            .finish()
    }
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Registry<P> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(BTreeMap::new()),
        }
    }

    /// Returns the entry for `name`, creating a default one when absent.
    #[must_use]
    pub fn entry(&self, name: &str) -> Arc<RegistryEntry<P>> {
        self.entries_lock()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(RegistryEntry::new(name, None, false)))
            .clone()
    }

    /// Registers a configuration function for `name`, replacing any prior
    /// entry for that seedbed.
    pub fn register_configuration(
        &self,
        name: &str,
        deploy_if_not_exists: bool,
        configure: ConfigureFn,
    ) {
        self.entries_lock().insert(
            name.to_owned(),
            Arc::new(RegistryEntry::new(
                name,
                Some(configure),
                deploy_if_not_exists,
            )),
        );
    }

    /// Returns the registered seedbed names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries_lock().keys().cloned().collect()
    }

    fn entries_lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<RegistryEntry<P>>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
