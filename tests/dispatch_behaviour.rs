//! Behavioural coverage for the remote execution dispatcher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;

use sower::buildspec::{self, SpecParams};
use sower::dispatch::{BundleSource, DispatchError, Dispatcher};
use sower::services::{BuildStatus, RetryPolicy, ServiceError};
use sower::test_support::{FakePlatform, build_snapshot, sample_outputs};

fn fast_dispatcher() -> Dispatcher {
    Dispatcher::new()
        .with_poll_interval(Duration::from_millis(1))
        .with_status_retry(RetryPolicy::new(3, Duration::ZERO))
}

fn archive_source() -> BundleSource {
    BundleSource::Archive {
        path: Utf8PathBuf::from("/tmp/bundle.tar.gz"),
        group: None,
    }
}

fn spec() -> sower::ExecutionSpec {
    buildspec::generate(&sample_outputs(), SpecParams::default())
}

async fn run_dispatch(
    platform: &FakePlatform,
    source: &BundleSource,
) -> Result<sower::BuildInfo, DispatchError> {
    fast_dispatcher()
        .run(
            platform,
            &sample_outputs(),
            source,
            &spec(),
            30,
            sower::services::StartBuildOverrides::default(),
            None,
        )
        .await
}

#[rstest]
#[tokio::test]
async fn successful_dispatch_returns_exported_variables() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(
        BuildStatus::Succeeded,
        &[("SOWER_OUTPUT", "\"hello\""), ("EXTRA", "val")],
    ));

    let build = run_dispatch(&platform, &archive_source())
        .await
        .expect("dispatch should succeed");

    assert_eq!(build.status, BuildStatus::Succeeded);
    assert_eq!(
        build.exported_env_vars.get("EXTRA").map(String::as_str),
        Some("val")
    );
}

#[rstest]
#[tokio::test]
async fn start_request_references_the_uploaded_bundle() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));

    run_dispatch(&platform, &archive_source())
        .await
        .expect("dispatch should succeed");

    let uploads = platform.uploads();
    let upload = uploads.first().expect("one bundle upload expected");
    assert_eq!(upload.bucket, "sower-bucket");
    assert!(
        upload.key.starts_with("sower/") && upload.key.ends_with("/bundle.tar.gz"),
        "unexpected key: {}",
        upload.key
    );

    let requests = platform.start_requests();
    let request = requests.first().expect("one start request expected");
    assert_eq!(request.project_name, "sower-project");
    assert!(request.privileged_mode);
    assert!(
        request.stream_name.starts_with("sower-"),
        "unexpected stream name: {}",
        request.stream_name
    );
    assert_eq!(
        request.source_location,
        format!("sower-bucket/{}", upload.key)
    );
}

#[rstest]
#[tokio::test]
async fn bundle_group_namespaces_the_object_key() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));

    fast_dispatcher()
        .run(
            &platform,
            &sample_outputs(),
            &BundleSource::Archive {
                path: Utf8PathBuf::from("/tmp/bundle.tar.gz"),
                group: Some(String::from("group-a")),
            },
            &spec(),
            30,
            sower::services::StartBuildOverrides::default(),
            None,
        )
        .await
        .expect("dispatch should succeed");

    let uploads = platform.uploads();
    let upload = uploads.first().expect("one bundle upload expected");
    assert!(
        upload.key.starts_with("sower/group-a/"),
        "unexpected key: {}",
        upload.key
    );
}

#[rstest]
#[tokio::test]
async fn non_success_terminal_status_raises_with_build_identity() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::Failed, &[]));

    let err = run_dispatch(&platform, &archive_source())
        .await
        .expect_err("failed build must raise");

    match err {
        DispatchError::ExecutionFailed {
            build_id, status, ..
        } => {
            assert!(!build_id.is_empty());
            assert_eq!(status, BuildStatus::Failed);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[case(BuildStatus::Succeeded)]
#[case(BuildStatus::Failed)]
#[tokio::test]
async fn uploaded_bundle_is_deleted_on_success_and_failure(#[case] status: BuildStatus) {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(status, &[]));

    let result = run_dispatch(&platform, &archive_source()).await;
    assert_eq!(result.is_ok(), status == BuildStatus::Succeeded);

    let uploads = platform.uploads();
    let uploaded_key = &uploads.first().expect("one upload expected").key;
    let deletes = platform.deletes();
    let cleanup = deletes.last().expect("cleanup deletion expected");
    assert_eq!(cleanup.keys, vec![uploaded_key.clone()]);
    assert!(
        platform.object_keys().is_empty(),
        "bundle object must not outlive the dispatch"
    );
}

#[rstest]
#[tokio::test]
async fn cleanup_failure_does_not_mask_a_successful_execution() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));
    // First deletion (stale-key clear) succeeds, cleanup deletion fails.
    platform.push_delete_ok();
    platform.push_delete_failure(ServiceError::Api {
        service: String::from("store"),
        message: String::from("delete refused"),
    });

    let build = run_dispatch(&platform, &archive_source())
        .await
        .expect("cleanup failure must not mask success");

    assert_eq!(build.status, BuildStatus::Succeeded);
}

#[rstest]
#[tokio::test]
async fn prebuilt_bundle_skips_upload_and_cleanup() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));

    let build = run_dispatch(
        &platform,
        &BundleSource::Prebuilt {
            location: String::from("sower-bucket/prebuilt/bundle.tar.gz"),
        },
    )
    .await
    .expect("dispatch should succeed");

    assert_eq!(build.status, BuildStatus::Succeeded);
    assert!(platform.uploads().is_empty());
    assert!(platform.deletes().is_empty());
    let requests = platform.start_requests();
    assert_eq!(
        requests.first().expect("one start request").source_location,
        "sower-bucket/prebuilt/bundle.tar.gz"
    );
}

#[rstest]
#[tokio::test]
async fn transient_status_failures_are_retried_then_succeed() {
    let platform = FakePlatform::new();
    platform.push_build_info_failure(ServiceError::Api {
        service: String::from("build"),
        message: String::from("transient 1"),
    });
    platform.push_build_info_failure(ServiceError::Api {
        service: String::from("build"),
        message: String::from("transient 2"),
    });
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));

    let build = run_dispatch(&platform, &archive_source())
        .await
        .expect("third status fetch should succeed");

    assert_eq!(build.status, BuildStatus::Succeeded);
    assert_eq!(platform.build_info_calls(), 3);
}

#[rstest]
#[tokio::test]
async fn log_lines_arrive_in_order_without_duplicates_across_polls() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::InProgress, &[]));
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));
    platform.set_log_stream("sower-run/stream", 0);
    // First poll sees T1 and T2; the second poll additionally sees T3.
    platform.push_log_batch(&[(1_000, "first\n"), (1_001, "second\n")]);
    platform.push_log_batch(&[(1_002, "third\n")]);

    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let callback = move |line: &str| {
        sink.lock().expect("line sink").push(line.to_owned());
    };

    fast_dispatcher()
        .run(
            &platform,
            &sample_outputs(),
            &archive_source(),
            &spec(),
            30,
            sower::services::StartBuildOverrides::default(),
            Some(&callback),
        )
        .await
        .expect("dispatch should succeed");

    assert_eq!(
        lines.lock().expect("line sink").clone(),
        vec![
            String::from("first"),
            String::from("second"),
            String::from("third"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn stream_discovery_race_is_tolerated() {
    let platform = FakePlatform::new();
    platform.push_build_snapshot(build_snapshot(BuildStatus::InProgress, &[]));
    platform.push_build_snapshot(build_snapshot(BuildStatus::Succeeded, &[]));
    // The stream only materialises at the second lookup.
    platform.set_log_stream("sower-run/stream", 1);
    platform.push_log_batch(&[(1_000, "late line")]);
    platform.push_log_batch(&[]);

    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let callback = move |line: &str| {
        sink.lock().expect("line sink").push(line.to_owned());
    };

    fast_dispatcher()
        .run(
            &platform,
            &sample_outputs(),
            &archive_source(),
            &spec(),
            30,
            sower::services::StartBuildOverrides::default(),
            Some(&callback),
        )
        .await
        .expect("dispatch should succeed");

    let lookups = platform.stream_lookups();
    assert!(lookups.len() >= 2, "expected repeated lookups: {lookups:?}");
    assert!(
        lookups.iter().all(|prefix| prefix.ends_with('/')),
        "prefix lookups must target the stream namespace: {lookups:?}"
    );
    assert_eq!(
        lines.lock().expect("line sink").clone(),
        vec![String::from("late line")]
    );
}
