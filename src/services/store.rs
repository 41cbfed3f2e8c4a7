//! Object-store contract and batch deletion helpers.

use std::time::Duration;

use camino::Utf8Path;

use super::{RetryPolicy, ServiceError, ServiceFuture, retry_with_jitter};

/// Maximum number of keys a single delete request may carry.
pub const DELETE_BATCH_MAX: usize = 1_000;

/// A single stored object version, as returned by version listings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectVersion {
    /// Object key.
    pub key: String,
    /// Version identifier, when the bucket is versioned.
    pub version_id: Option<String>,
}

/// Minimal object-store interface required by the dispatch core.
pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `path` to `bucket` under `key`.
    fn upload_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        path: &'a Utf8Path,
    ) -> ServiceFuture<'a, ()>;

    /// Deletes the given keys from `bucket` in a single request.
    ///
    /// Callers must respect [`DELETE_BATCH_MAX`]; use [`delete_in_batches`]
    /// for arbitrary key counts.
    fn delete_objects<'a>(&'a self, bucket: &'a str, keys: &'a [String]) -> ServiceFuture<'a, ()>;

    /// Lists every object version in `bucket`, following pagination.
    fn list_object_versions<'a>(&'a self, bucket: &'a str)
    -> ServiceFuture<'a, Vec<ObjectVersion>>;
}

/// Deletes `keys` from `bucket`, chunked to the service batch maximum.
///
/// Each chunk is retried with jittered backoff while the provider signals
/// throttling; other failures surface immediately.
///
/// # Errors
///
/// Returns the first non-throttling [`ServiceError`], or the final
/// throttling error once the retry budget for a chunk is exhausted.
pub async fn delete_in_batches<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    keys: &[String],
) -> Result<(), ServiceError> {
    delete_in_batches_with_policy(store, bucket, keys, RetryPolicy::new(4, Duration::from_secs(3)))
        .await
}

/// [`delete_in_batches`] with an explicit retry policy.
///
/// # Errors
///
/// Returns the first non-throttling [`ServiceError`], or the final
/// throttling error once the retry budget for a chunk is exhausted.
pub async fn delete_in_batches_with_policy<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    keys: &[String],
    policy: RetryPolicy,
) -> Result<(), ServiceError> {
    for chunk in keys.chunks(DELETE_BATCH_MAX) {
        let result = retry_with_jitter(policy, || async {
            match store.delete_objects(bucket, chunk).await {
                Ok(()) => Ok(Ok(())),
                Err(err) if err.is_throttling() => Err(err),
                Err(err) => Ok(Err(err)),
            }
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) | Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Deletes every object version in `bucket`, used by seedbed teardown.
///
/// # Errors
///
/// Returns [`ServiceError`] when the listing or any deletion batch fails.
pub async fn purge_bucket<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
) -> Result<(), ServiceError> {
    let versions = store.list_object_versions(bucket).await?;
    let keys: Vec<String> = versions.into_iter().map(|version| version.key).collect();
    if keys.is_empty() {
        return Ok(());
    }
    tracing::debug!(bucket, count = keys.len(), "purging object versions");
    delete_in_batches(store, bucket, &keys).await
}
