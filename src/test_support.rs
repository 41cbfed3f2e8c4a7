//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::seedbed::{SeedbedHost, SeedbedOutputs};
use crate::services::{
    BuildInfo, BuildLogs, BuildService, BuildStatus, LogBatch, LogEvent, LogService, ObjectStore,
    ObjectVersion, ServiceError, ServiceFuture, StartBuildRequest,
};

/// Records a single object upload made through [`FakePlatform`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadRecord {
    /// Target bucket.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Local path that was uploaded.
    pub path: Utf8PathBuf,
}

/// Records a single batch deletion made through [`FakePlatform`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeleteRecord {
    /// Target bucket.
    pub bucket: String,
    /// Keys requested for deletion.
    pub keys: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    deployed: BTreeMap<String, SeedbedOutputs>,
    deployable: BTreeMap<String, SeedbedOutputs>,
    uploads: Vec<UploadRecord>,
    deletes: Vec<DeleteRecord>,
    objects: BTreeSet<String>,
    start_requests: Vec<StartBuildRequest>,
    build_snapshots: VecDeque<BuildInfo>,
    build_info_failures: VecDeque<ServiceError>,
    delete_outcomes: VecDeque<Option<ServiceError>>,
    build_info_calls: u32,
    deployed_calls: u32,
    stream_name: Option<String>,
    stream_available_after: u32,
    stream_lookups: Vec<String>,
    visible_events: Vec<LogEvent>,
    pending_event_batches: VecDeque<Vec<LogEvent>>,
}

/// Scripted provider platform driving deterministic dispatch outcomes
/// without any network access.
///
/// Build snapshots are consumed in FIFO order, with the final snapshot
/// repeated for any further status fetch. Scripted failures are returned
/// before snapshots, which exercises the bounded-retry paths.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl std::fmt::Debug for FakePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePlatform").finish_non_exhaustive()
    }
}

impl FakePlatform {
    /// Creates a fake with no scripted behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `name` as already deployed with the given outputs.
    pub fn seed_deployed(&self, name: &str, outputs: SeedbedOutputs) {
        self.state().deployed.insert(name.to_owned(), outputs);
    }

    /// Makes `name` provisionable: a `deploy` call moves it to deployed.
    pub fn seed_deployable(&self, name: &str, outputs: SeedbedOutputs) {
        self.state().deployable.insert(name.to_owned(), outputs);
    }

    /// Queues a build snapshot returned by a status fetch.
    pub fn push_build_snapshot(&self, snapshot: BuildInfo) {
        self.state().build_snapshots.push_back(snapshot);
    }

    /// Queues a failure returned by a status fetch before any snapshot.
    pub fn push_build_info_failure(&self, error: ServiceError) {
        self.state().build_info_failures.push_back(error);
    }

    /// Queues a successful outcome for the next object deletion.
    pub fn push_delete_ok(&self) {
        self.state().delete_outcomes.push_back(None);
    }

    /// Queues a failure for the next object deletion.
    pub fn push_delete_failure(&self, error: ServiceError) {
        self.state().delete_outcomes.push_back(Some(error));
    }

    /// Configures the log stream resolved by prefix lookups; the stream
    /// appears only after `available_after` unsuccessful lookups.
    pub fn set_log_stream(&self, name: &str, available_after: u32) {
        let mut state = self.state();
        state.stream_name = Some(name.to_owned());
        state.stream_available_after = available_after;
    }

    /// Queues a batch of log events that becomes visible at the next event
    /// fetch, simulating delivery spread across poll iterations.
    pub fn push_log_batch(&self, events: &[(i64, &str)]) {
        let batch = events
            .iter()
            .map(|(timestamp_ms, message)| LogEvent {
                timestamp_ms: *timestamp_ms,
                message: (*message).to_owned(),
            })
            .collect();
        self.state().pending_event_batches.push_back(batch);
    }

    /// Returns every recorded upload.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.state().uploads.clone()
    }

    /// Returns every recorded deletion batch.
    #[must_use]
    pub fn deletes(&self) -> Vec<DeleteRecord> {
        self.state().deletes.clone()
    }

    /// Returns every recorded build start request.
    #[must_use]
    pub fn start_requests(&self) -> Vec<StartBuildRequest> {
        self.state().start_requests.clone()
    }

    /// Returns the prefixes passed to stream lookups.
    #[must_use]
    pub fn stream_lookups(&self) -> Vec<String> {
        self.state().stream_lookups.clone()
    }

    /// Returns how many status fetches were made.
    #[must_use]
    pub fn build_info_calls(&self) -> u32 {
        self.state().build_info_calls
    }

    /// Returns how many deployed-state lookups were made.
    #[must_use]
    pub fn deployed_calls(&self) -> u32 {
        self.state().deployed_calls
    }

    /// Returns the keys currently present in the fake object store.
    #[must_use]
    pub fn object_keys(&self) -> Vec<String> {
        self.state().objects.iter().cloned().collect()
    }
}

impl ObjectStore for FakePlatform {
    fn upload_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        path: &'a Utf8Path,
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.uploads.push(UploadRecord {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                path: path.to_path_buf(),
            });
            state.objects.insert(key.to_owned());
            Ok(())
        })
    }

    fn delete_objects<'a>(&'a self, bucket: &'a str, keys: &'a [String]) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(Some(error)) = state.delete_outcomes.pop_front() {
                return Err(error);
            }
            state.deletes.push(DeleteRecord {
                bucket: bucket.to_owned(),
                keys: keys.to_vec(),
            });
            for key in keys {
                state.objects.remove(key);
            }
            Ok(())
        })
    }

    fn list_object_versions<'a>(
        &'a self,
        _bucket: &'a str,
    ) -> ServiceFuture<'a, Vec<ObjectVersion>> {
        Box::pin(async move {
            Ok(self
                .state()
                .objects
                .iter()
                .map(|key| ObjectVersion {
                    key: key.clone(),
                    version_id: None,
                })
                .collect())
        })
    }
}

impl BuildService for FakePlatform {
    fn start_build<'a>(&'a self, request: &'a StartBuildRequest) -> ServiceFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state();
            state.start_requests.push(request.clone());
            Ok(format!("{}:build-{}", request.project_name, state.start_requests.len()))
        })
    }

    fn build_info<'a>(&'a self, build_id: &'a str) -> ServiceFuture<'a, BuildInfo> {
        Box::pin(async move {
            let mut state = self.state();
            state.build_info_calls += 1;
            if let Some(error) = state.build_info_failures.pop_front() {
                return Err(error);
            }
            let snapshot = if state.build_snapshots.len() > 1 {
                state.build_snapshots.pop_front()
            } else {
                state.build_snapshots.front().cloned()
            };
            snapshot
                .map(|mut info| {
                    info.build_id = build_id.to_owned();
                    info
                })
                .ok_or_else(|| ServiceError::NotFound {
                    service: String::from("build"),
                    name: build_id.to_owned(),
                })
        })
    }
}

impl LogService for FakePlatform {
    fn stream_name_by_prefix<'a>(
        &'a self,
        _group: &'a str,
        prefix: &'a str,
    ) -> ServiceFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut state = self.state();
            state.stream_lookups.push(prefix.to_owned());
            let lookups = u32::try_from(state.stream_lookups.len()).unwrap_or(u32::MAX);
            if lookups <= state.stream_available_after {
                return Ok(None);
            }
            Ok(state.stream_name.clone())
        })
    }

    fn log_events<'a>(
        &'a self,
        _group: &'a str,
        _stream: &'a str,
        start_time_ms: Option<i64>,
    ) -> ServiceFuture<'a, LogBatch> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(batch) = state.pending_event_batches.pop_front() {
                state.visible_events.extend(batch);
            }
            let events: Vec<LogEvent> = state
                .visible_events
                .iter()
                .filter(|event| start_time_ms.is_none_or(|start| event.timestamp_ms >= start))
                .cloned()
                .collect();
            let last_timestamp_ms = events.last().map(|event| event.timestamp_ms);
            Ok(LogBatch {
                events,
                last_timestamp_ms,
            })
        })
    }
}

impl SeedbedHost for FakePlatform {
    fn deployed<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, Option<SeedbedOutputs>> {
        Box::pin(async move {
            let mut state = self.state();
            state.deployed_calls += 1;
            Ok(state.deployed.get(name).cloned())
        })
    }

    fn deploy<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(outputs) = state.deployable.remove(name) {
                state.deployed.insert(name.to_owned(), outputs);
            }
            Ok(())
        })
    }
}

/// Produces seedbed outputs with no package repository.
#[must_use]
pub fn sample_outputs() -> SeedbedOutputs {
    SeedbedOutputs {
        build_project: String::from("sower-project"),
        bucket: String::from("sower-bucket"),
        package_repository: None,
    }
}

/// Produces a build snapshot with logs enabled and the given exports.
#[must_use]
pub fn build_snapshot(status: BuildStatus, exports: &[(&str, &str)]) -> BuildInfo {
    BuildInfo {
        build_id: String::from("unset"),
        status,
        current_phase: String::from("BUILD"),
        start_time_ms: 1_000,
        end_time_ms: status.is_terminal().then_some(2_000),
        phases: Vec::new(),
        logs: BuildLogs {
            enabled: true,
            group_name: Some(String::from("/builds/sower-project")),
            stream_name: None,
        },
        exported_env_vars: exports
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect(),
    }
}
