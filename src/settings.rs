//! Harness-level settings loaded via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Harness settings derived from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, Eq, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "SOWER")]
pub struct HarnessSettings {
    /// Scratch directory bundles are assembled in. Defaults to `sower.out`
    /// below the working directory.
    #[ortho_config(default = Utf8PathBuf::from("sower.out"))]
    pub out_dir: Utf8PathBuf,
    /// Interval between build status polls, in seconds.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// File the remote side writes the serialised return value to.
    #[ortho_config(default = Utf8PathBuf::from("/tmp/sower_export.sh"))]
    pub export_file: Utf8PathBuf,
}

/// Metadata for a settings field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl HarnessSettings {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), SettingsError> {
        if value.trim().is_empty() {
            return Err(SettingsError::MissingField(format!(
                "missing {}: set {} or add {} to sower.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads settings using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags
    /// in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, SettingsError> {
        Self::load().map_err(|err| SettingsError::Parse(err.to_string()))
    }

    /// Loads settings without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        Self::load_from_iter([std::ffi::OsString::from("sower")])
            .map_err(|err| SettingsError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MissingField`] when a required field is
    /// empty, or [`SettingsError::InvalidValue`] when the poll interval is
    /// zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        Self::require_field(
            self.out_dir.as_str(),
            &FieldMetadata::new("scratch output directory", "SOWER_OUT_DIR", "out_dir"),
        )?;
        Self::require_field(
            self.export_file.as_str(),
            &FieldMetadata::new("result export file", "SOWER_EXPORT_FILE", "export_file"),
        )?;
        if self.poll_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(String::from(
                "poll_interval_secs must be greater than zero",
            )));
        }
        Ok(())
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            out_dir: Utf8PathBuf::from("sower.out"),
            poll_interval_secs: 5,
            export_file: Utf8PathBuf::from("/tmp/sower_export.sh"),
        }
    }
}

/// Errors raised during settings loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Indicates a required settings field is empty or missing.
    #[error("missing settings field: {0}")]
    MissingField(String),
    /// Indicates a settings field holds an unusable value.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("settings parsing failed: {0}")]
    Parse(String),
}
