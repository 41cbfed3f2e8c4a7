//! The orchestrator owning the registry, platform handle, and settings.

use std::env;
use std::sync::Arc;

use crate::config::SeedbedConfig;
use crate::function::RemoteFunctionBuilder;
use crate::registry::Registry;
use crate::seedbed::SeedbedHost;
use crate::services::{BuildService, LogService, ObjectStore};
use crate::settings::HarnessSettings;

/// Environment marker distinguishing the orchestrating process from a
/// process running inside the remote build.
pub const EXECUTING_ENV_VAR: &str = "SOWER_EXECUTING";

/// Full set of provider services the harness operates against.
pub trait Platform: ObjectStore + BuildService + LogService + SeedbedHost {}

impl<T: ObjectStore + BuildService + LogService + SeedbedHost + ?Sized> Platform for T {}

/// Where the current process is executing.
///
/// Resolved once per [`Sower`] construction; every per-call dispatch branch
/// keys off this value rather than re-reading the environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    /// This process orchestrates dispatches.
    Local,
    /// This process is running inside the remote build.
    Remote,
}

impl ExecutionMode {
    /// Reads the process-wide execution marker.
    #[must_use]
    pub fn detect() -> Self {
        match env::var(EXECUTING_ENV_VAR) {
            Ok(value) if is_truthy(&value) => Self::Remote,
            _ => Self::Local,
        }
    }

    /// Returns `true` when the process is inside the remote build.
    #[must_use]
    pub const fn is_remote(self) -> bool {
        matches!(self, Self::Remote)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Options applied when registering a seedbed's configuration function.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConfigureOptions {
    /// Provision the seedbed on demand when a dispatch finds it absent.
    pub deploy_if_not_exists: bool,
}

/// The remote execution orchestrator.
///
/// Owns the seedbed registry and the provider platform; registrations and
/// dispatches flow through this instance instead of process-global state.
/// The registry starts empty and is never pruned before the instance drops.
#[derive(Debug)]
pub struct Sower<P> {
    platform: Arc<P>,
    registry: Registry<P>,
    settings: HarnessSettings,
    mode: ExecutionMode,
}

impl<P: Platform> Sower<P> {
    /// Creates an orchestrator, detecting the execution mode from the
    /// process environment.
    #[must_use]
    pub fn new(platform: P, settings: HarnessSettings) -> Self {
        Self::with_mode(platform, settings, ExecutionMode::detect())
    }

    /// Creates an orchestrator with an explicit execution mode.
    #[must_use]
    pub fn with_mode(platform: P, settings: HarnessSettings, mode: ExecutionMode) -> Self {
        Self {
            platform: Arc::new(platform),
            registry: Registry::new(),
            settings,
            mode,
        }
    }

    /// Registers the one-time configuration function for `seedbed`.
    ///
    /// The function runs lazily, under the seedbed's entry lock, the first
    /// time any of the seedbed's functions is dispatched. Registering again
    /// replaces the seedbed's entry.
    pub fn configure(
        &self,
        seedbed: &str,
        options: ConfigureOptions,
        configure: impl FnOnce(&mut SeedbedConfig) + Send + Sync + 'static,
    ) {
        self.registry.register_configuration(
            seedbed,
            options.deploy_if_not_exists,
            Box::new(configure),
        );
    }

    /// Starts a builder registering a remote function against `seedbed`.
    #[must_use]
    pub fn remote_function(&self, seedbed: &str) -> RemoteFunctionBuilder<P> {
        RemoteFunctionBuilder::new(
            self.registry.entry(seedbed),
            self.platform.clone(),
            self.settings.clone(),
            self.mode,
        )
    }

    /// Returns the seedbed registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry<P> {
        &self.registry
    }

    /// Returns the harness settings.
    #[must_use]
    pub const fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Returns the resolved execution mode.
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Returns the provider platform handle.
    #[must_use]
    pub const fn platform(&self) -> &Arc<P> {
        &self.platform
    }
}
