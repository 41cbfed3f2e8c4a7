//! Build-service contract and execution status types.

use std::collections::BTreeMap;
use std::fmt;

use super::ServiceFuture;

/// Terminal and non-terminal states of a remote build execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStatus {
    /// The execution completed successfully.
    Succeeded,
    /// The execution failed in one of its phases.
    Failed,
    /// The execution failed due to an infrastructure fault.
    Fault,
    /// The execution was stopped by an operator.
    Stopped,
    /// The execution exceeded its service-side timeout.
    TimedOut,
    /// The execution is still running.
    InProgress,
}

impl BuildStatus {
    /// Returns `true` once the execution can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Returns the provider wire label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Fault => "FAULT",
            Self::Stopped => "STOPPED",
            Self::TimedOut => "TIMED_OUT",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic context attached to a build phase by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildPhaseContext {
    /// Provider status code, when one was reported.
    pub status_code: Option<String>,
    /// Human-readable diagnostic message.
    pub message: Option<String>,
}

/// One entry of a build's phase history.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildPhase {
    /// Provider phase name (for example `INSTALL` or `BUILD`).
    pub name: String,
    /// Status of the phase, absent while the phase is current.
    pub status: Option<BuildStatus>,
    /// Phase start, milliseconds since the epoch.
    pub start_time_ms: i64,
    /// Phase end, milliseconds since the epoch, absent while running.
    pub end_time_ms: Option<i64>,
    /// Diagnostic contexts reported for the phase.
    pub contexts: Vec<BuildPhaseContext>,
}

/// Location of a build's log stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildLogs {
    /// Whether log delivery is enabled for the build.
    pub enabled: bool,
    /// Log group receiving the build's output.
    pub group_name: Option<String>,
    /// Log stream within the group, once created.
    pub stream_name: Option<String>,
}

/// Snapshot of a remote build execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildInfo {
    /// Provider build identifier.
    pub build_id: String,
    /// Overall execution status.
    pub status: BuildStatus,
    /// Name of the phase currently executing (or last executed).
    pub current_phase: String,
    /// Build start, milliseconds since the epoch.
    pub start_time_ms: i64,
    /// Build end, milliseconds since the epoch, absent while running.
    pub end_time_ms: Option<i64>,
    /// Phase history in execution order.
    pub phases: Vec<BuildPhase>,
    /// Log stream location for the build.
    pub logs: BuildLogs,
    /// Environment variables exported by the execution.
    pub exported_env_vars: BTreeMap<String, String>,
}

/// A single environment-variable override submitted with a build start.
///
/// The `kind` tag distinguishes literal values from parameter-store and
/// secret-manager references so the build service resolves secrets at
/// execution time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvVarOverride {
    /// Variable name.
    pub name: String,
    /// Literal value or typed reference.
    pub value: String,
    /// Wire label of the variable kind.
    pub kind: String,
}

/// Per-execution overrides applied when starting a build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartBuildOverrides {
    /// Alternative container image.
    pub image: Option<String>,
    /// Alternative execution role.
    pub service_role: Option<String>,
    /// Alternative environment type.
    pub environment_type: Option<String>,
    /// Alternative compute type.
    pub compute_type: Option<String>,
    /// Additional environment variables.
    pub env_vars: Vec<EnvVarOverride>,
}

impl StartBuildOverrides {
    /// Returns `true` when no override is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && self.service_role.is_none()
            && self.environment_type.is_none()
            && self.compute_type.is_none()
            && self.env_vars.is_empty()
    }
}

/// Parameters for starting a remote build execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartBuildRequest {
    /// Build project to execute in.
    pub project_name: String,
    /// Log stream name requested for the execution.
    pub stream_name: String,
    /// Object-store location of the source bundle, as `bucket/key`.
    pub source_location: String,
    /// Inline build specification document.
    pub spec_document: String,
    /// Execution timeout in minutes, enforced server-side.
    pub timeout_minutes: u32,
    /// Whether the build runs in privileged mode.
    pub privileged_mode: bool,
    /// Per-execution overrides.
    pub overrides: StartBuildOverrides,
}

/// Minimal build-service interface required by the dispatch core.
pub trait BuildService: Send + Sync {
    /// Starts a build execution and returns its identifier.
    fn start_build<'a>(&'a self, request: &'a StartBuildRequest) -> ServiceFuture<'a, String>;

    /// Fetches the current snapshot of a build execution.
    fn build_info<'a>(&'a self, build_id: &'a str) -> ServiceFuture<'a, BuildInfo>;
}
