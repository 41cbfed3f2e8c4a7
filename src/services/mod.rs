//! Provider-facing service contracts consumed by the dispatch core.
//!
//! The harness never talks to a cloud provider directly. Each concern is a
//! narrow trait implemented by the embedding application (or by the fakes in
//! [`crate::test_support`]); all operations share the [`ServiceError`] type
//! so retries and batching can reason about failures uniformly.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

mod build;
mod logs;
mod retry;
mod store;

pub use build::{
    BuildInfo, BuildLogs, BuildPhase, BuildPhaseContext, BuildService, BuildStatus,
    EnvVarOverride, StartBuildOverrides, StartBuildRequest,
};
pub use logs::{LogBatch, LogEvent, LogService};
pub use retry::{RetryPolicy, retry_with_jitter};
pub use store::{
    DELETE_BATCH_MAX, ObjectStore, ObjectVersion, delete_in_batches,
    delete_in_batches_with_policy, purge_bucket,
};

/// Future returned by service operations.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send + 'a>>;

/// Errors raised by provider service implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServiceError {
    /// Raised when the provider throttles a request.
    #[error("{service} request was throttled: {message}")]
    Throttled {
        /// Service that rejected the request.
        service: String,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when a referenced remote entity does not exist.
    #[error("{service} entity not found: {name}")]
    NotFound {
        /// Service that performed the lookup.
        service: String,
        /// Identifier that could not be resolved.
        name: String,
    },
    /// Wrapper for other provider-level failures.
    #[error("{service} request failed: {message}")]
    Api {
        /// Service that performed the request.
        service: String,
        /// Message returned by the provider.
        message: String,
    },
}

impl ServiceError {
    /// Returns `true` when the provider signalled throttling.
    #[must_use]
    pub const fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}
