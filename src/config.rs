//! Seedbed configuration and the layered merge applied at dispatch time.
//!
//! A [`SeedbedConfig`] holds the environment-wide defaults mutated by a
//! seedbed's one-time configuration function. [`CallOverrides`] carries the
//! per-registration additions supplied when a remote function is built. The
//! merge is deliberately mechanical: lists concatenate with environment
//! values first, maps shallow-merge with override keys winning, and
//! single-value fields prefer the override when one is set.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

/// Default remote execution timeout in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 30;

/// Default command used to re-enter the runner inside the seedbed.
pub const DEFAULT_REMOTE_ENTRYPOINT: &str = "sower-runner";

/// An environment variable injected into the remote execution.
///
/// Secret-bearing variables are carried as typed references so the build
/// service resolves them at execution time instead of embedding secret
/// values in the submitted specification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnvVarValue {
    /// A literal value passed through unchanged.
    Plaintext(String),
    /// A reference resolved from the provider's parameter store.
    ParameterStore(String),
    /// A reference resolved from the provider's secret manager.
    SecretsManager(String),
}

impl EnvVarValue {
    /// Returns the raw value or reference text.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Plaintext(value) | Self::ParameterStore(value) | Self::SecretsManager(value) => {
                value
            }
        }
    }

    /// Returns the wire label for the variable kind.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::Plaintext(_) => "PLAINTEXT",
            Self::ParameterStore(_) => "PARAMETER_STORE",
            Self::SecretsManager(_) => "SECRETS_MANAGER",
        }
    }
}

impl From<&str> for EnvVarValue {
    fn from(value: &str) -> Self {
        Self::Plaintext(value.to_owned())
    }
}

impl From<String> for EnvVarValue {
    fn from(value: String) -> Self {
        Self::Plaintext(value)
    }
}

/// Configuration attached to a named seedbed.
///
/// Created with defaults, mutated exactly once by the seedbed's
/// configuration function, and read by every dispatch thereafter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeedbedConfig {
    /// Remote execution timeout in minutes.
    pub timeout_minutes: u32,
    /// Packages installed with the execution image's package tooling.
    pub packages: Vec<String>,
    /// CLI tools installed with `cargo install`.
    pub tools: Vec<String>,
    /// Local source crates bundled and installed remotely, name to path.
    pub local_crates: BTreeMap<String, Utf8PathBuf>,
    /// Requirement files bundled as `requirements-{name}` and installed
    /// during the install phase, name to path.
    pub requirements_files: BTreeMap<String, Utf8PathBuf>,
    /// Local directories bundled into the execution, archive name to path.
    pub dirs: BTreeMap<String, Utf8PathBuf>,
    /// Local files bundled into the execution, archive name to path.
    pub files: BTreeMap<String, Utf8PathBuf>,
    /// Environment variables injected into the execution.
    pub env_vars: BTreeMap<String, EnvVarValue>,
    /// Environment variables exported back from the execution.
    pub exported_env_vars: Vec<String>,
    /// Commands appended to the install phase.
    pub install_commands: Vec<String>,
    /// Commands appended to the pre-build phase.
    pub pre_build_commands: Vec<String>,
    /// Commands run in the build phase before the remote function executes.
    pub pre_execution_commands: Vec<String>,
    /// Commands run in the build phase after the remote function executes.
    pub build_commands: Vec<String>,
    /// Commands appended to the post-build phase.
    pub post_build_commands: Vec<String>,
    /// Alternative container image for the execution.
    pub build_image: Option<String>,
    /// Alternative execution role for the build.
    pub build_role: Option<String>,
    /// Alternative environment type (for example `LINUX_CONTAINER`).
    pub environment_type: Option<String>,
    /// Alternative compute type (for example `BUILD_GENERAL1_SMALL`).
    pub compute_type: Option<String>,
    /// Runtime versions installed during the install phase.
    pub runtime_versions: BTreeMap<String, String>,
    /// Whether a failing phase aborts the remaining phases.
    pub abort_phases_on_failure: bool,
    /// Object-store location of a pre-built bundle to execute instead of
    /// bundling locally, as `bucket/key`.
    pub prebuilt_bundle: Option<String>,
    /// Command that re-enters the runner inside the seedbed.
    pub remote_entrypoint: String,
}

impl Default for SeedbedConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            packages: Vec::new(),
            tools: Vec::new(),
            local_crates: BTreeMap::new(),
            requirements_files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            exported_env_vars: Vec::new(),
            install_commands: Vec::new(),
            pre_build_commands: Vec::new(),
            pre_execution_commands: Vec::new(),
            build_commands: Vec::new(),
            post_build_commands: Vec::new(),
            build_image: None,
            build_role: None,
            environment_type: None,
            compute_type: None,
            runtime_versions: default_runtime_versions(),
            abort_phases_on_failure: true,
            prebuilt_bundle: None,
            remote_entrypoint: String::from(DEFAULT_REMOTE_ENTRYPOINT),
        }
    }
}

/// Baseline runtime versions installed when no override is supplied.
#[must_use]
pub fn default_runtime_versions() -> BTreeMap<String, String> {
    BTreeMap::from([
        (String::from("python"), String::from("3.11")),
        (String::from("docker"), String::from("20")),
    ])
}

/// Per-registration additions layered over a seedbed's configuration.
///
/// List fields are appended after the environment's values; map keys win
/// over environment keys on conflict; single-value fields replace the
/// environment value when set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallOverrides {
    /// Additional packages to install.
    pub packages: Vec<String>,
    /// Additional CLI tools to install.
    pub tools: Vec<String>,
    /// Additional local source crates to bundle.
    pub local_crates: BTreeMap<String, Utf8PathBuf>,
    /// Additional requirement files to bundle.
    pub requirements_files: BTreeMap<String, Utf8PathBuf>,
    /// Additional directories to bundle.
    pub dirs: BTreeMap<String, Utf8PathBuf>,
    /// Additional files to bundle.
    pub files: BTreeMap<String, Utf8PathBuf>,
    /// Additional environment variables to inject.
    pub env_vars: BTreeMap<String, EnvVarValue>,
    /// Additional environment variables to export.
    pub exported_env_vars: Vec<String>,
    /// Additional install-phase commands.
    pub install_commands: Vec<String>,
    /// Additional pre-build-phase commands.
    pub pre_build_commands: Vec<String>,
    /// Additional pre-execution commands.
    pub pre_execution_commands: Vec<String>,
    /// Additional build-phase commands.
    pub build_commands: Vec<String>,
    /// Additional post-build-phase commands.
    pub post_build_commands: Vec<String>,
    /// Timeout override in minutes.
    pub timeout_minutes: Option<u32>,
    /// Container image override.
    pub build_image: Option<String>,
    /// Execution role override.
    pub build_role: Option<String>,
    /// Environment type override.
    pub environment_type: Option<String>,
    /// Compute type override.
    pub compute_type: Option<String>,
    /// Runtime versions override; replaces the environment map wholesale.
    pub runtime_versions: Option<BTreeMap<String, String>>,
    /// Abort-on-failure override.
    pub abort_phases_on_failure: Option<bool>,
    /// Pre-built bundle override.
    pub prebuilt_bundle: Option<String>,
    /// Remote entrypoint override.
    pub remote_entrypoint: Option<String>,
}

impl SeedbedConfig {
    /// Merges per-registration overrides over this configuration.
    ///
    /// Command and package lists concatenate with the environment values
    /// first, preserving order and duplicates. Maps shallow-merge with
    /// override keys winning on conflict. Single-value fields take the
    /// override when present and fall back to the environment value.
    #[must_use]
    pub fn merged_with(&self, overrides: &CallOverrides) -> Self {
        Self {
            timeout_minutes: overrides.timeout_minutes.unwrap_or(self.timeout_minutes),
            packages: concat_lists(&self.packages, &overrides.packages),
            tools: concat_lists(&self.tools, &overrides.tools),
            local_crates: merge_maps(&self.local_crates, &overrides.local_crates),
            requirements_files: merge_maps(&self.requirements_files, &overrides.requirements_files),
            dirs: merge_maps(&self.dirs, &overrides.dirs),
            files: merge_maps(&self.files, &overrides.files),
            env_vars: merge_maps(&self.env_vars, &overrides.env_vars),
            exported_env_vars: concat_lists(&self.exported_env_vars, &overrides.exported_env_vars),
            install_commands: concat_lists(&self.install_commands, &overrides.install_commands),
            pre_build_commands: concat_lists(
                &self.pre_build_commands,
                &overrides.pre_build_commands,
            ),
            pre_execution_commands: concat_lists(
                &self.pre_execution_commands,
                &overrides.pre_execution_commands,
            ),
            build_commands: concat_lists(&self.build_commands, &overrides.build_commands),
            post_build_commands: concat_lists(
                &self.post_build_commands,
                &overrides.post_build_commands,
            ),
            build_image: overrides
                .build_image
                .clone()
                .or_else(|| self.build_image.clone()),
            build_role: overrides
                .build_role
                .clone()
                .or_else(|| self.build_role.clone()),
            environment_type: overrides
                .environment_type
                .clone()
                .or_else(|| self.environment_type.clone()),
            compute_type: overrides
                .compute_type
                .clone()
                .or_else(|| self.compute_type.clone()),
            runtime_versions: overrides
                .runtime_versions
                .clone()
                .unwrap_or_else(|| self.runtime_versions.clone()),
            abort_phases_on_failure: overrides
                .abort_phases_on_failure
                .unwrap_or(self.abort_phases_on_failure),
            prebuilt_bundle: overrides
                .prebuilt_bundle
                .clone()
                .or_else(|| self.prebuilt_bundle.clone()),
            remote_entrypoint: overrides
                .remote_entrypoint
                .clone()
                .unwrap_or_else(|| self.remote_entrypoint.clone()),
        }
    }
}

fn concat_lists<T: Clone>(base: &[T], extra: &[T]) -> Vec<T> {
    let mut merged = Vec::with_capacity(base.len() + extra.len());
    merged.extend_from_slice(base);
    merged.extend_from_slice(extra);
    merged
}

fn merge_maps<V: Clone>(
    base: &BTreeMap<String, V>,
    extra: &BTreeMap<String, V>,
) -> BTreeMap<String, V> {
    let mut merged = base.clone();
    for (key, value) in extra {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
