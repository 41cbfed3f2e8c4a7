//! Generation of the phase-structured execution specification.
//!
//! The specification is the declarative document handed to the build
//! service: four ordered phases of shell commands plus runtime pins,
//! exported variable names, and the abort-on-failure policy. Command lists
//! are concatenated in a fixed order and never reordered or deduplicated;
//! the caller is responsible for layering environment defaults before
//! per-call additions.

use std::collections::BTreeMap;

use serde::Serialize;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::runner::OUTPUT_ENV_VAR;
use crate::seedbed::SeedbedOutputs;

/// Specification document version understood by the build service.
pub const SPEC_VERSION: &str = "0.2";

/// Location of the extracted bundle inside the build container.
pub const BUNDLE_SRC_DIR: &str = "${CODEBUILD_SRC_DIR}/bundle";

/// Name of the support script shipped inside every bundle.
pub const SUPPORT_SCRIPT_NAME: &str = "registry_login.sh";

/// Errors raised while rendering a specification document.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when the specification cannot be serialised.
    #[error("failed to serialise execution spec: {message}")]
    Serialise {
        /// Serialiser error message.
        message: String,
    },
}

/// Environment section of the specification.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SpecEnv {
    /// Shell used for all phase commands.
    pub shell: String,
    /// Plain variables set for the whole execution.
    pub variables: BTreeMap<String, String>,
    /// Variables exported back to the orchestrator.
    #[serde(rename = "exported-variables")]
    pub exported_variables: Vec<String>,
}

/// One phase of the specification.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SpecPhase {
    /// Runtime versions installed before the phase commands run; only
    /// populated on the install phase.
    #[serde(rename = "runtime-versions", skip_serializing_if = "Option::is_none")]
    pub runtime_versions: Option<BTreeMap<String, String>>,
    /// Shell commands executed in order.
    pub commands: Vec<String>,
    /// Behaviour when a command fails: `ABORT` or `CONTINUE`.
    #[serde(rename = "on-failure")]
    pub on_failure: String,
}

/// The four ordered phases of an execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SpecPhases {
    /// Install phase.
    pub install: SpecPhase,
    /// Pre-build phase.
    pub pre_build: SpecPhase,
    /// Build phase.
    pub build: SpecPhase,
    /// Post-build phase.
    pub post_build: SpecPhase,
}

/// A complete execution specification.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExecutionSpec {
    /// Document version.
    pub version: String,
    /// Environment section.
    pub env: SpecEnv,
    /// Phase commands.
    pub phases: SpecPhases,
}

impl ExecutionSpec {
    /// Renders the specification as the inline document submitted with the
    /// build start request. JSON is emitted, which the build service accepts
    /// as a specification document.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Serialise`] when rendering fails.
    pub fn to_document(&self) -> Result<String, SpecError> {
        serde_json::to_string_pretty(self).map_err(|err| SpecError::Serialise {
            message: err.to_string(),
        })
    }
}

/// Caller-supplied inputs to specification generation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SpecParams {
    /// Install-phase commands, appended after the generated prelude.
    pub install_commands: Vec<String>,
    /// Pre-build-phase commands.
    pub pre_build_commands: Vec<String>,
    /// Build-phase commands.
    pub build_commands: Vec<String>,
    /// Post-build-phase commands.
    pub post_build_commands: Vec<String>,
    /// Plain variables set for the whole execution.
    pub env_vars: BTreeMap<String, String>,
    /// Variables exported back to the orchestrator; the output channel
    /// variable is always appended.
    pub exported_env_vars: Vec<String>,
    /// Runtime versions installed during the install phase.
    pub runtime_versions: BTreeMap<String, String>,
    /// Whether a failing phase aborts the remaining phases.
    pub abort_phases_on_failure: bool,
}

/// Builds an [`ExecutionSpec`] for the given seedbed.
///
/// The install phase always starts with relocation of the bundled support
/// script and a best-effort container-registry login that reports failure
/// without aborting the build. When the seedbed exposes a package
/// repository, a login against it follows; its domain and repository are
/// shell-escaped before interpolation.
#[must_use]
pub fn generate(outputs: &SeedbedOutputs, params: SpecParams) -> ExecutionSpec {
    let mut install = vec![
        String::from("mkdir -p /var/scripts/"),
        format!("mv {BUNDLE_SRC_DIR}/{SUPPORT_SCRIPT_NAME} /var/scripts/{SUPPORT_SCRIPT_NAME} || true"),
        format!(
            "bash /var/scripts/{SUPPORT_SCRIPT_NAME} && echo 'Container registry login complete' || echo 'Container registry login failed'"
        ),
    ];
    if let Some(repository) = &outputs.package_repository {
        let domain = escape(repository.domain.as_str().into());
        let name = escape(repository.repository.as_str().into());
        install.push(format!(
            "aws codeartifact login --tool pip --domain {domain} --repository {name}"
        ));
    }
    install.extend(params.install_commands);

    let mut exported_variables = params.exported_env_vars;
    exported_variables.push(String::from(OUTPUT_ENV_VAR));

    let on_failure = if params.abort_phases_on_failure {
        String::from("ABORT")
    } else {
        String::from("CONTINUE")
    };
    let runtime_versions = if params.runtime_versions.is_empty() {
        None
    } else {
        Some(params.runtime_versions)
    };

    ExecutionSpec {
        version: String::from(SPEC_VERSION),
        env: SpecEnv {
            shell: String::from("bash"),
            variables: params.env_vars,
            exported_variables,
        },
        phases: SpecPhases {
            install: SpecPhase {
                runtime_versions,
                commands: install,
                on_failure: on_failure.clone(),
            },
            pre_build: SpecPhase {
                runtime_versions: None,
                commands: params.pre_build_commands,
                on_failure: on_failure.clone(),
            },
            build: SpecPhase {
                runtime_versions: None,
                commands: params.build_commands,
                on_failure: on_failure.clone(),
            },
            post_build: SpecPhase {
                runtime_versions: None,
                commands: params.post_build_commands,
                on_failure,
            },
        },
    }
}
