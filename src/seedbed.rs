//! Seedbed descriptors and the host trait used to resolve them.
//!
//! A seedbed is a named, previously provisioned set of cloud resources that
//! remote functions dispatch against. The harness never inspects the
//! infrastructure template itself; it only consumes the named outputs listed
//! here. Resolution happens on every dispatch because seedbeds can be
//! created or replaced concurrently by other processes.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::services::ServiceFuture;

/// Named output carrying the build project reference.
pub const OUTPUT_BUILD_PROJECT: &str = "BuildProject";
/// Named output carrying the artifact bucket reference.
pub const OUTPUT_BUCKET: &str = "Bucket";
/// Named output carrying the optional package repository domain.
pub const OUTPUT_PACKAGE_DOMAIN: &str = "PackageDomain";
/// Named output carrying the optional package repository name.
pub const OUTPUT_PACKAGE_REPOSITORY: &str = "PackageRepository";

/// Errors raised while interpreting a seedbed's named outputs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SeedbedError {
    /// Raised when a required named output is absent.
    #[error("seedbed `{seedbed}` is missing required output `{output}`")]
    MissingOutput {
        /// Seedbed whose outputs were inspected.
        seedbed: String,
        /// Name of the absent output.
        output: String,
    },
}

/// Package repository exposed by a seedbed, used for install-phase logins.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageRepository {
    /// Repository domain.
    pub domain: String,
    /// Repository name within the domain.
    pub repository: String,
}

/// Resolved addresses and identifiers of a seedbed's cloud resources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeedbedOutputs {
    /// Build project remote executions are started against.
    pub build_project: String,
    /// Object-store bucket bundles are uploaded to.
    pub bucket: String,
    /// Optional package repository for install-phase logins.
    pub package_repository: Option<PackageRepository>,
}

impl SeedbedOutputs {
    /// Interprets the named outputs of a deployed seedbed.
    ///
    /// The package repository is resolved only when both of its outputs are
    /// present; a lone domain or repository output is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SeedbedError::MissingOutput`] when the build project or
    /// bucket output is absent.
    pub fn from_named_outputs(
        seedbed: &str,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Self, SeedbedError> {
        let build_project = require_output(seedbed, outputs, OUTPUT_BUILD_PROJECT)?;
        let bucket = require_output(seedbed, outputs, OUTPUT_BUCKET)?;
        let package_repository = match (
            outputs.get(OUTPUT_PACKAGE_DOMAIN),
            outputs.get(OUTPUT_PACKAGE_REPOSITORY),
        ) {
            (Some(domain), Some(repository)) => Some(PackageRepository {
                domain: domain.clone(),
                repository: repository.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            build_project,
            bucket,
            package_repository,
        })
    }
}

fn require_output(
    seedbed: &str,
    outputs: &BTreeMap<String, String>,
    output: &str,
) -> Result<String, SeedbedError> {
    outputs
        .get(output)
        .cloned()
        .ok_or_else(|| SeedbedError::MissingOutput {
            seedbed: seedbed.to_owned(),
            output: output.to_owned(),
        })
}

/// Host-side view of seedbed deployments.
///
/// Implementations wrap the provider's infrastructure template service.
/// Provisioning itself is an external collaborator operation; the harness
/// only triggers it when a seedbed is registered with deploy-on-demand.
pub trait SeedbedHost: Send + Sync {
    /// Returns the resolved outputs of `name` when it is deployed.
    ///
    /// A `None` result means the seedbed does not exist; it is not an error
    /// because on-demand provisioning may follow.
    fn deployed<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, Option<SeedbedOutputs>>;

    /// Provisions the seedbed named `name`.
    fn deploy<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn full_outputs() -> BTreeMap<String, String> {
        BTreeMap::from([
            (String::from(OUTPUT_BUILD_PROJECT), String::from("proj")),
            (String::from(OUTPUT_BUCKET), String::from("bucket")),
            (String::from(OUTPUT_PACKAGE_DOMAIN), String::from("dom")),
            (String::from(OUTPUT_PACKAGE_REPOSITORY), String::from("repo")),
        ])
    }

    #[rstest]
    fn resolves_all_outputs() {
        let outputs =
            SeedbedOutputs::from_named_outputs("sb", &full_outputs()).expect("outputs resolve");

        assert_eq!(outputs.build_project, "proj");
        assert_eq!(outputs.bucket, "bucket");
        assert_eq!(
            outputs.package_repository,
            Some(PackageRepository {
                domain: String::from("dom"),
                repository: String::from("repo"),
            })
        );
    }

    #[rstest]
    #[case(OUTPUT_BUILD_PROJECT)]
    #[case(OUTPUT_BUCKET)]
    fn missing_required_output_is_fatal(#[case] removed: &str) {
        let mut outputs = full_outputs();
        outputs.remove(removed);

        let err = SeedbedOutputs::from_named_outputs("sb", &outputs)
            .expect_err("missing output should fail");

        assert_eq!(
            err,
            SeedbedError::MissingOutput {
                seedbed: String::from("sb"),
                output: String::from(removed),
            }
        );
    }

    #[rstest]
    fn lone_package_output_is_ignored() {
        let mut outputs = full_outputs();
        outputs.remove(OUTPUT_PACKAGE_REPOSITORY);

        let resolved =
            SeedbedOutputs::from_named_outputs("sb", &outputs).expect("outputs resolve");

        assert_eq!(resolved.package_repository, None);
    }
}
