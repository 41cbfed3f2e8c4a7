//! Remote function wrappers and the per-call dispatch flow.
//!
//! A [`RemoteFunction`] preserves the wrapped callable's calling convention:
//! invoking it from the orchestrating process bundles the call and ships it
//! to the seedbed, while invoking it inside the seedbed runs the callable
//! directly and exports its return value. Wrappers are built fresh per
//! registration, so nesting a registration inside another function with
//! call-site overrides is just constructing another builder.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::buildspec::{self, BUNDLE_SRC_DIR, SpecParams};
use crate::bundle::{self, BundleError};
use crate::config::{CallOverrides, SeedbedConfig};
use crate::dispatch::{BundleSource, DispatchError, Dispatcher};
use crate::harness::{ExecutionMode, Platform};
use crate::invocation::{ARGS_FILE_NAME, FunctionId, FunctionInvocation};
use crate::registry::{EntryState, RegistryEntry};
use crate::runner::{self, OUTPUT_ENV_VAR, RemoteCallable, RunnerError};
use crate::seedbed::SeedbedOutputs;
use crate::services::{EnvVarOverride, ServiceError, StartBuildOverrides};
use crate::settings::HarnessSettings;

/// Errors surfaced when calling a remote function.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// Raised when a builder is finished without a function identifier.
    #[error("remote function registration requires a function identifier")]
    MissingIdentifier,
    /// Raised when declared local paths cannot be resolved. Checked before
    /// any network call so misconfiguration fails fast.
    #[error(
        "unresolved local paths for `{fn_id}`: missing directories {missing_dirs:?}, missing files {missing_files:?}"
    )]
    MissingLocalPaths {
        /// Identifier of the function being dispatched.
        fn_id: FunctionId,
        /// Declared directories that are absent or not directories.
        missing_dirs: Vec<Utf8PathBuf>,
        /// Declared files that are absent or not files.
        missing_files: Vec<Utf8PathBuf>,
    },
    /// Raised when the target seedbed is not deployed and on-demand
    /// provisioning is disabled or did not produce it.
    #[error("seedbed `{seedbed}` is not deployed")]
    NotDeployed {
        /// Name of the absent seedbed.
        seedbed: String,
    },
    /// Raised when a provider service call fails.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Raised when bundle assembly fails.
    #[error(transparent)]
    Bundle(#[from] BundleError),
    /// Raised when the dispatch itself fails.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Raised when the remote-side export cannot be written.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// Raised when the callable fails during remote-side execution.
    #[error("remote function `{fn_id}` failed: {message}")]
    Callable {
        /// Identifier of the failing callable.
        fn_id: FunctionId,
        /// Error reported by the callable.
        message: String,
    },
    /// Raised when the exported return value is not valid JSON.
    #[error("failed to decode exported return value: {message}")]
    DecodeOutput {
        /// Decoder error message.
        message: String,
    },
}

/// Result of one remote function call.
///
/// The designated output variable is decoded into `value`; every other
/// exported variable is returned in `exports`. An empty `exports` map means
/// the execution surfaced only the primary value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DispatchOutcome {
    /// Decoded return value of the remote function, when one was exported.
    pub value: Option<Value>,
    /// Exported variables other than the output channel.
    pub exports: BTreeMap<String, String>,
}

impl DispatchOutcome {
    /// Returns `true` when secondary exported variables are present.
    #[must_use]
    pub fn has_exports(&self) -> bool {
        !self.exports.is_empty()
    }

    /// Consumes the outcome, returning only the primary value.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        self.value
    }
}

/// A wrapped callable whose invocation is redirected to a seedbed.
pub struct RemoteFunction<P> {
    fn_id: FunctionId,
    callable: RemoteCallable,
    entry: Arc<RegistryEntry<P>>,
    platform: Arc<P>,
    settings: HarnessSettings,
    mode: ExecutionMode,
    overrides: CallOverrides,
    bundle_group: Option<String>,
    log_callback: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    dispatcher: Dispatcher,
}

impl<P> std::fmt::Debug for RemoteFunction<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("fn_id", &self.fn_id)
            .field("seedbed", &self.entry.name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> RemoteFunction<P> {
    /// Returns the identifier this wrapper dispatches under.
    #[must_use]
    pub const fn fn_id(&self) -> &FunctionId {
        &self.fn_id
    }

    /// Invokes the function with the given positional and keyword arguments.
    ///
    /// In the orchestrating process this bundles the call, ships it to the
    /// seedbed, and unmarshals the exported result. Inside the seedbed the
    /// callable runs directly and a non-null return value is written to the
    /// export file for the surrounding build phases to pick up.
    ///
    /// # Errors
    ///
    /// Returns [`FunctionError`] for configuration problems, an undeployed
    /// seedbed, service failures, or a failed remote execution. No fatal
    /// error is converted into an empty outcome.
    pub async fn call(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<DispatchOutcome, FunctionError> {
        match self.mode {
            ExecutionMode::Remote => self.call_in_seedbed(&args, &kwargs),
            ExecutionMode::Local => self.dispatch_to_seedbed(args, kwargs).await,
        }
    }

    fn call_in_seedbed(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<DispatchOutcome, FunctionError> {
        let result = self.callable.as_ref()(args, kwargs).map_err(|err| FunctionError::Callable {
            fn_id: self.fn_id.clone(),
            message: err.to_string(),
        })?;
        if let Some(value) = &result {
            runner::write_export_file(&self.settings.export_file, value)?;
        }
        Ok(DispatchOutcome {
            value: result,
            exports: BTreeMap::new(),
        })
    }

    async fn dispatch_to_seedbed(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<DispatchOutcome, FunctionError> {
        let (merged, outputs) = self.prepare_dispatch().await?;

        tracing::info!(
            fn_id = %self.fn_id,
            seedbed = %self.entry.name(),
            "beginning remote execution"
        );

        let invocation = FunctionInvocation {
            fn_id: self.fn_id.clone(),
            args,
            kwargs,
        };
        let source = self.stage_source(&merged, &invocation)?;
        let spec = buildspec::generate(&outputs, self.spec_params(&merged));
        let overrides = start_overrides(&merged);
        let log_callback = self.log_callback.as_deref();

        let build = self
            .dispatcher
            .run(
                self.platform.as_ref(),
                &outputs,
                &source,
                &spec,
                merged.timeout_minutes,
                overrides,
                log_callback,
            )
            .await?;

        unmarshal_outcome(build.exported_env_vars)
    }

    /// Runs the configure/resolve sequence under the entry lock.
    ///
    /// Path validation happens inside the critical section but before the
    /// deployed check, so configuration errors surface without any network
    /// call. The lock is released before bundling and dispatch.
    async fn prepare_dispatch(
        &self,
    ) -> Result<(SeedbedConfig, SeedbedOutputs), FunctionError> {
        let mut state = self.entry.lock_state().await;
        state.ensure_configured();
        let merged = state.config.merged_with(&self.overrides);
        self.validate_local_paths(&merged)?;
        let outputs = self.resolve_outputs(&mut state).await?;
        Ok((merged, outputs))
    }

    async fn resolve_outputs(
        &self,
        state: &mut EntryState,
    ) -> Result<SeedbedOutputs, FunctionError> {
        let name = self.entry.name();
        let outputs = match self.platform.deployed(name).await? {
            Some(outputs) => outputs,
            None if state.deploy_if_not_exists => {
                tracing::info!(seedbed = name, "seedbed not deployed; provisioning on demand");
                self.platform.deploy(name).await?;
                self.platform
                    .deployed(name)
                    .await?
                    .ok_or_else(|| FunctionError::NotDeployed {
                        seedbed: name.to_owned(),
                    })?
            }
            None => {
                return Err(FunctionError::NotDeployed {
                    seedbed: name.to_owned(),
                });
            }
        };
        state.outputs = Some(outputs.clone());
        Ok(outputs)
    }

    fn validate_local_paths(&self, merged: &SeedbedConfig) -> Result<(), FunctionError> {
        let mut missing_dirs: Vec<Utf8PathBuf> = Vec::new();
        for path in merged.local_crates.values().chain(merged.dirs.values()) {
            if !path.is_dir() {
                missing_dirs.push(path.clone());
            }
        }
        let mut missing_files: Vec<Utf8PathBuf> = Vec::new();
        for path in merged
            .requirements_files
            .values()
            .chain(merged.files.values())
        {
            if !path.is_file() {
                missing_files.push(path.clone());
            }
        }
        if missing_dirs.is_empty() && missing_files.is_empty() {
            return Ok(());
        }
        Err(FunctionError::MissingLocalPaths {
            fn_id: self.fn_id.clone(),
            missing_dirs,
            missing_files,
        })
    }

    fn stage_source(
        &self,
        merged: &SeedbedConfig,
        invocation: &FunctionInvocation,
    ) -> Result<BundleSource, FunctionError> {
        if let Some(location) = &merged.prebuilt_bundle {
            return Ok(BundleSource::Prebuilt {
                location: location.clone(),
            });
        }

        let mut dirs: Vec<(Utf8PathBuf, String)> = merged
            .local_crates
            .iter()
            .map(|(name, path)| (path.clone(), name.clone()))
            .collect();
        dirs.extend(
            merged
                .dirs
                .iter()
                .map(|(name, path)| (path.clone(), name.clone())),
        );
        let mut files: Vec<(Utf8PathBuf, String)> = merged
            .requirements_files
            .iter()
            .map(|(name, path)| (path.clone(), format!("requirements-{name}")))
            .collect();
        files.extend(
            merged
                .files
                .iter()
                .map(|(name, path)| (path.clone(), name.clone())),
        );

        let archive = bundle::generate_bundle(
            &self.settings.out_dir,
            invocation,
            &dirs,
            &files,
            self.bundle_group.as_deref(),
        )?;
        Ok(BundleSource::Archive {
            path: archive,
            group: self.bundle_group.clone(),
        })
    }

    fn spec_params(&self, merged: &SeedbedConfig) -> SpecParams {
        let enter_bundle = format!("cd {BUNDLE_SRC_DIR}");

        let mut install_commands = vec![enter_bundle.clone()];
        for name in merged.requirements_files.keys() {
            install_commands.push(format!("pip install -r requirements-{name}"));
        }
        for name in merged.local_crates.keys() {
            install_commands.push(format!("cargo install --path {name} --locked"));
        }
        if !merged.tools.is_empty() {
            install_commands.push(format!("cargo install {}", merged.tools.join(" ")));
        }
        if !merged.packages.is_empty() {
            install_commands.push(format!("apt-get install -y {}", merged.packages.join(" ")));
        }
        install_commands.extend(merged.install_commands.iter().cloned());

        let mut pre_build_commands = vec![enter_bundle.clone()];
        pre_build_commands.extend(merged.pre_build_commands.iter().cloned());

        let export_file = &self.settings.export_file;
        let mut build_commands = vec![enter_bundle.clone()];
        build_commands.extend(merged.pre_execution_commands.iter().cloned());
        build_commands.push(format!(
            "{} execute --args-file {ARGS_FILE_NAME} --debug",
            merged.remote_entrypoint
        ));
        build_commands.push(format!(
            "if [[ -f {export_file} ]]; then source {export_file}; else echo 'No return value to export'; fi"
        ));
        build_commands.extend(merged.build_commands.iter().cloned());

        let mut post_build_commands = vec![enter_bundle];
        post_build_commands.extend(merged.post_build_commands.iter().cloned());

        SpecParams {
            install_commands,
            pre_build_commands,
            build_commands,
            post_build_commands,
            env_vars: BTreeMap::new(),
            exported_env_vars: merged.exported_env_vars.clone(),
            runtime_versions: merged.runtime_versions.clone(),
            abort_phases_on_failure: merged.abort_phases_on_failure,
        }
    }
}

fn start_overrides(merged: &SeedbedConfig) -> StartBuildOverrides {
    StartBuildOverrides {
        image: merged.build_image.clone(),
        service_role: merged.build_role.clone(),
        environment_type: merged.environment_type.clone(),
        compute_type: merged.compute_type.clone(),
        env_vars: merged
            .env_vars
            .iter()
            .map(|(name, value)| EnvVarOverride {
                name: name.clone(),
                value: value.value().to_owned(),
                kind: value.kind_label().to_owned(),
            })
            .collect(),
    }
}

fn unmarshal_outcome(
    mut exports: BTreeMap<String, String>,
) -> Result<DispatchOutcome, FunctionError> {
    let value = match exports.remove(OUTPUT_ENV_VAR) {
        Some(raw) if !raw.is_empty() => {
            Some(
                serde_json::from_str(&raw).map_err(|err| FunctionError::DecodeOutput {
                    message: err.to_string(),
                })?,
            )
        }
        _ => None,
    };
    Ok(DispatchOutcome { value, exports })
}

/// Builder producing a [`RemoteFunction`] wrapper.
///
/// Obtained from [`crate::harness::Sower::remote_function`]; the finished
/// wrapper is recorded in the seedbed's entry, where a repeated registration
/// of the same identifier overwrites the previous one.
pub struct RemoteFunctionBuilder<P> {
    entry: Arc<RegistryEntry<P>>,
    platform: Arc<P>,
    settings: HarnessSettings,
    mode: ExecutionMode,
    fn_id: Option<FunctionId>,
    overrides: CallOverrides,
    bundle_group: Option<String>,
    log_callback: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    dispatcher: Dispatcher,
}

impl<P> std::fmt::Debug for RemoteFunctionBuilder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFunctionBuilder")
            .field("seedbed", &self.entry.name())
            .field("fn_id", &self.fn_id)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> RemoteFunctionBuilder<P> {
    pub(crate) fn new(
        entry: Arc<RegistryEntry<P>>,
        platform: Arc<P>,
        settings: HarnessSettings,
        mode: ExecutionMode,
    ) -> Self {
        let poll_interval = Duration::from_secs(settings.poll_interval_secs);
        Self {
            entry,
            platform,
            settings,
            mode,
            fn_id: None,
            overrides: CallOverrides::default(),
            bundle_group: None,
            log_callback: None,
            dispatcher: Dispatcher::new().with_poll_interval(poll_interval),
        }
    }

    /// Sets the identifier the function is registered and dispatched under.
    #[must_use]
    pub fn id(mut self, fn_id: FunctionId) -> Self {
        self.fn_id = Some(fn_id);
        self
    }

    /// Layers call-site overrides over the seedbed configuration.
    #[must_use]
    pub fn overrides(mut self, overrides: CallOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Overrides the execution timeout in minutes.
    #[must_use]
    pub const fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.overrides.timeout_minutes = Some(minutes);
        self
    }

    /// Namespaces this registration's bundles and object keys, keeping
    /// concurrent dispatches from colliding on shared scratch state.
    #[must_use]
    pub fn bundle_group(mut self, group: impl Into<String>) -> Self {
        self.bundle_group = Some(group.into());
        self
    }

    /// Registers a callback receiving each streamed log line.
    #[must_use]
    pub fn log_callback(mut self, callback: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.log_callback = Some(callback);
        self
    }

    /// Replaces the dispatcher, primarily to speed polling up in tests.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Finishes the builder, wrapping `callable` and recording the wrapper
    /// in the seedbed's entry.
    ///
    /// # Errors
    ///
    /// Returns [`FunctionError::MissingIdentifier`] when no identifier was
    /// set.
    pub fn build(self, callable: RemoteCallable) -> Result<Arc<RemoteFunction<P>>, FunctionError> {
        let fn_id = self.fn_id.ok_or(FunctionError::MissingIdentifier)?;
        let wrapper = Arc::new(RemoteFunction {
            fn_id: fn_id.clone(),
            callable,
            entry: self.entry.clone(),
            platform: self.platform,
            settings: self.settings,
            mode: self.mode,
            overrides: self.overrides,
            bundle_group: self.bundle_group,
            log_callback: self.log_callback,
            dispatcher: self.dispatcher,
        });
        self.entry.record_function(&fn_id, wrapper.clone());
        Ok(wrapper)
    }
}
