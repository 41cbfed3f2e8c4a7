//! End-to-end dispatch of a bundled invocation to the build service.
//!
//! A dispatch uploads the bundle under a collision-free key, starts a build
//! referencing it, polls status at a fixed interval while forwarding log
//! lines to an optional callback, and harvests the exported variables from
//! the terminal snapshot. The uploaded artifact is deleted afterwards
//! whether the execution succeeded or not; cleanup failures are logged and
//! never mask the primary outcome.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use crate::buildspec::{ExecutionSpec, SpecError};
use crate::bundle::ARCHIVE_NAME;
use crate::seedbed::SeedbedOutputs;
use crate::services::{
    BuildInfo, BuildService, BuildStatus, LogService, ObjectStore, RetryPolicy, ServiceError,
    StartBuildOverrides, StartBuildRequest, delete_in_batches, retry_with_jitter,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Prefix applied to every execution's log stream name.
pub const STREAM_NAME_PREFIX: &str = "sower";

/// Leading segment of every uploaded bundle's object key.
pub const ARCHIVE_KEY_PREFIX: &str = "sower";

/// Callback invoked with each forwarded log line.
pub type LogCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Services a dispatch requires from the provider.
pub trait DispatchServices: ObjectStore + BuildService + LogService {}

impl<T: ObjectStore + BuildService + LogService + ?Sized> DispatchServices for T {}

/// Source of the build's input bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BundleSource {
    /// A locally assembled archive uploaded (and later deleted) by the
    /// dispatcher.
    Archive {
        /// Path of the archive on local disk.
        path: Utf8PathBuf,
        /// Optional caller-supplied group namespacing the object key.
        group: Option<String>,
    },
    /// A pre-built bundle already present in the object store; never
    /// uploaded or deleted by the dispatcher.
    Prebuilt {
        /// Object-store location as `bucket/key`.
        location: String,
    },
}

/// Errors raised while dispatching a remote execution.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Raised when the specification document cannot be rendered.
    #[error(transparent)]
    Spec(#[from] SpecError),
    /// Raised when a provider service call fails.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Raised when the execution reaches a terminal status other than
    /// success.
    #[error("remote execution {build_id} finished with status {status} in phase {phase}")]
    ExecutionFailed {
        /// Provider build identifier.
        build_id: String,
        /// Terminal status reported by the build service.
        status: BuildStatus,
        /// Phase the execution finished in.
        phase: String,
    },
}

/// Drives one remote execution from upload to terminal status.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    poll_interval: Duration,
    status_retry: RetryPolicy,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with the default polling cadence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            status_retry: RetryPolicy::default(),
        }
    }

    /// Overrides the status polling interval.
    ///
    /// This is primarily used by tests to keep polling scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the retry policy applied to status fetches.
    #[must_use]
    pub const fn with_status_retry(mut self, policy: RetryPolicy) -> Self {
        self.status_retry = policy;
        self
    }

    /// Runs a dispatch against `outputs` and returns the terminal snapshot.
    ///
    /// The uploaded artifact is always deleted before returning, for both
    /// success and failure; a pre-built bundle is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when upload, start, polling, or the
    /// execution itself fails. A non-success terminal status is surfaced as
    /// [`DispatchError::ExecutionFailed`], never a silent return.
    pub async fn run<P: DispatchServices + ?Sized>(
        &self,
        platform: &P,
        outputs: &SeedbedOutputs,
        source: &BundleSource,
        spec: &ExecutionSpec,
        timeout_minutes: u32,
        overrides: StartBuildOverrides,
        log_callback: Option<LogCallback<'_>>,
    ) -> Result<BuildInfo, DispatchError> {
        let execution_id = Uuid::new_v4().simple().to_string();
        let stream_prefix = format!("{STREAM_NAME_PREFIX}-{execution_id}");
        let spec_document = spec.to_document()?;

        let (source_location, uploaded_key) = self
            .stage_bundle(platform, outputs, source, &execution_id)
            .await?;

        let request = StartBuildRequest {
            project_name: outputs.build_project.clone(),
            stream_name: stream_prefix.clone(),
            source_location,
            spec_document,
            timeout_minutes,
            privileged_mode: true,
            overrides,
        };

        let result = self
            .execute(platform, &request, &stream_prefix, log_callback)
            .await;

        if let Some(key) = uploaded_key
            && let Err(err) = delete_in_batches(platform, &outputs.bucket, &[key]).await
        {
            tracing::warn!(error = %err, "failed to delete uploaded bundle after dispatch");
        }

        result
    }

    async fn stage_bundle<P: DispatchServices + ?Sized>(
        &self,
        platform: &P,
        outputs: &SeedbedOutputs,
        source: &BundleSource,
        execution_id: &str,
    ) -> Result<(String, Option<String>), DispatchError> {
        match source {
            BundleSource::Prebuilt { location } => {
                tracing::debug!(%location, "dispatching pre-built bundle");
                Ok((location.clone(), None))
            }
            BundleSource::Archive { path, group } => {
                let key = group.as_deref().map_or_else(
                    || format!("{ARCHIVE_KEY_PREFIX}/{execution_id}/{ARCHIVE_NAME}"),
                    |group_id| format!("{ARCHIVE_KEY_PREFIX}/{group_id}/{execution_id}/{ARCHIVE_NAME}"),
                );
                let keys = vec![key.clone()];
                platform.delete_objects(&outputs.bucket, &keys).await?;
                platform.upload_file(&outputs.bucket, &key, path).await?;
                tracing::debug!(bucket = %outputs.bucket, %key, "uploaded bundle");
                Ok((format!("{}/{key}", outputs.bucket), Some(key)))
            }
        }
    }

    async fn execute<P: DispatchServices + ?Sized>(
        &self,
        platform: &P,
        request: &StartBuildRequest,
        stream_prefix: &str,
        log_callback: Option<LogCallback<'_>>,
    ) -> Result<BuildInfo, DispatchError> {
        let build_id = platform.start_build(request).await?;
        tracing::info!(%build_id, project = %request.project_name, "started remote execution");
        self.wait_for_completion(platform, &build_id, stream_prefix, log_callback)
            .await
    }

    async fn wait_for_completion<P: DispatchServices + ?Sized>(
        &self,
        platform: &P,
        build_id: &str,
        stream_prefix: &str,
        log_callback: Option<LogCallback<'_>>,
    ) -> Result<BuildInfo, DispatchError> {
        let mut stream_name: Option<String> = None;
        let mut last_seen_ms: Option<i64> = None;
        let mut build = self.fetch_info(platform, build_id).await?;

        loop {
            self.forward_logs(
                platform,
                &build,
                stream_prefix,
                &mut stream_name,
                &mut last_seen_ms,
                log_callback,
            )
            .await?;

            if build.status.is_terminal() {
                break;
            }
            sleep(self.poll_interval).await;

            let previous_phase = build.current_phase.clone();
            let previous_status = build.status;
            build = self.fetch_info(platform, build_id).await?;
            if build.current_phase != previous_phase || build.status != previous_status {
                tracing::info!(
                    build_id,
                    phase = %build.current_phase,
                    status = %build.status,
                    "remote execution progressed"
                );
            }
        }

        if build.status != BuildStatus::Succeeded {
            return Err(DispatchError::ExecutionFailed {
                build_id: build.build_id.clone(),
                status: build.status,
                phase: build.current_phase.clone(),
            });
        }
        Ok(build)
    }

    async fn fetch_info<P: DispatchServices + ?Sized>(
        &self,
        platform: &P,
        build_id: &str,
    ) -> Result<BuildInfo, ServiceError> {
        retry_with_jitter(self.status_retry, || platform.build_info(build_id)).await
    }

    /// Forwards any new log events to the callback.
    ///
    /// The stream is resolved lazily by prefix because it only appears once
    /// the build starts producing output. Events are fetched strictly after
    /// the last seen timestamp plus one millisecond so the boundary event is
    /// never re-emitted.
    async fn forward_logs<P: DispatchServices + ?Sized>(
        &self,
        platform: &P,
        build: &BuildInfo,
        stream_prefix: &str,
        stream_name: &mut Option<String>,
        last_seen_ms: &mut Option<i64>,
        log_callback: Option<LogCallback<'_>>,
    ) -> Result<(), ServiceError> {
        if !build.logs.enabled {
            return Ok(());
        }
        let Some(group) = build.logs.group_name.as_deref() else {
            return Ok(());
        };

        if stream_name.is_none() {
            *stream_name = platform
                .stream_name_by_prefix(group, &format!("{stream_prefix}/"))
                .await?;
        }
        let Some(stream) = stream_name.as_deref() else {
            return Ok(());
        };

        let start_time_ms = last_seen_ms.map(|timestamp| timestamp.saturating_add(1));
        let batch = platform.log_events(group, stream, start_time_ms).await?;
        for event in &batch.events {
            let line = event.message.strip_suffix('\n').unwrap_or(&event.message);
            tracing::debug!(line, "remote build log");
            if let Some(callback) = log_callback {
                callback(line);
            }
        }
        if let Some(timestamp) = batch.last_timestamp_ms {
            *last_seen_ms = Some(timestamp);
        }
        Ok(())
    }
}
