//! Unit tests for bundle assembly.

use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use rstest::rstest;
use tempfile::TempDir;

use crate::invocation::{ARGS_FILE_NAME, FunctionInvocation};

use super::*;

fn utf8(temp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("temp path should be UTF-8")
}

fn sample_invocation() -> FunctionInvocation {
    FunctionInvocation::new("pkg.tasks:run".parse().expect("id"))
}

fn write_file(root: &Utf8Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path()).expect("create parent");
    }
    fs::write(path.as_std_path(), contents).expect("write file");
}

fn archive_entry_names(archive: &Utf8Path) -> BTreeSet<String> {
    let file = fs::File::open(archive.as_std_path()).expect("open archive");
    let mut entries = BTreeSet::new();
    let mut reader = tar::Archive::new(GzDecoder::new(file));
    for entry in reader.entries().expect("archive entries") {
        let entry = entry.expect("archive entry");
        let path = entry.path().expect("entry path");
        entries.insert(path.to_string_lossy().trim_end_matches('/').to_owned());
    }
    entries
}

#[rstest]
fn bundle_contains_manifest_support_script_and_declared_content() {
    let out_temp = TempDir::new().expect("out dir");
    let src_temp = TempDir::new().expect("src dir");
    let out_root = utf8(&out_temp);
    let src_root = utf8(&src_temp);

    write_file(&src_root, "lib.rs", "pub fn ok() {}");
    write_file(&src_root, "nested/mod.rs", "pub mod inner;");
    write_file(&src_root, "target/debug/cache.o", "ignored");
    write_file(&src_root, "extra.toml", "[table]");

    let archive = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root.clone(), String::from("module"))],
        &[(src_root.join("extra.toml"), String::from("conf/extra.toml"))],
        None,
    )
    .expect("bundle should build");

    let entries = archive_entry_names(&archive);
    assert!(entries.contains(&format!("bundle/{ARGS_FILE_NAME}")));
    assert!(entries.contains(&format!("bundle/{SUPPORT_SCRIPT_NAME}")));
    assert!(entries.contains("bundle/module/lib.rs"));
    assert!(entries.contains("bundle/module/nested/mod.rs"));
    assert!(entries.contains("bundle/conf/extra.toml"));
    assert!(
        !entries
            .iter()
            .any(|entry| entry.contains("target") || entry.contains("cache.o")),
        "ignored paths leaked into the archive: {entries:?}"
    );
}

#[rstest]
fn directory_empty_after_filtering_is_fatal_and_leaves_no_archive() {
    let out_temp = TempDir::new().expect("out dir");
    let src_temp = TempDir::new().expect("src dir");
    let out_root = utf8(&out_temp);
    let src_root = utf8(&src_temp);

    write_file(&src_root, "target/only.o", "ignored");

    let err = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root.clone(), String::from("module"))],
        &[],
        None,
    )
    .expect_err("filtered-out directory should fail");

    assert!(
        matches!(err, BundleError::EmptySource { ref name, .. } if name == "module"),
        "unexpected error: {err}"
    );
    assert!(
        !out_root.join(ARCHIVE_NAME).exists(),
        "no archive may exist after a fatal bundling error"
    );
}

#[rstest]
fn missing_directory_source_is_fatal() {
    let out_temp = TempDir::new().expect("out dir");
    let out_root = utf8(&out_temp);

    let err = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(out_root.join("absent"), String::from("module"))],
        &[],
        None,
    )
    .expect_err("missing source should fail");

    assert!(matches!(err, BundleError::MissingSource { .. }));
}

#[rstest]
fn missing_file_source_is_fatal() {
    let out_temp = TempDir::new().expect("out dir");
    let out_root = utf8(&out_temp);

    let err = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[],
        &[(out_root.join("absent.toml"), String::from("absent.toml"))],
        None,
    )
    .expect_err("missing file should fail");

    assert!(matches!(err, BundleError::MissingSource { .. }));
}

#[rstest]
fn scratch_directory_is_cleared_between_invocations() {
    let out_temp = TempDir::new().expect("out dir");
    let src_temp = TempDir::new().expect("src dir");
    let out_root = utf8(&out_temp);
    let src_root = utf8(&src_temp);

    write_file(&src_root, "first.rs", "pub fn first() {}");
    generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root.clone(), String::from("module"))],
        &[],
        None,
    )
    .expect("first bundle");

    fs::remove_file(src_root.join("first.rs").as_std_path()).expect("remove first source");
    write_file(&src_root, "second.rs", "pub fn second() {}");
    let archive = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root, String::from("module"))],
        &[],
        None,
    )
    .expect("second bundle");

    let entries = archive_entry_names(&archive);
    assert!(entries.contains("bundle/module/second.rs"));
    assert!(
        !entries.contains("bundle/module/first.rs"),
        "stale content leaked across invocations: {entries:?}"
    );
}

#[rstest]
fn bundle_group_namespaces_the_scratch_directory() {
    let out_temp = TempDir::new().expect("out dir");
    let src_temp = TempDir::new().expect("src dir");
    let out_root = utf8(&out_temp);
    let src_root = utf8(&src_temp);

    write_file(&src_root, "lib.rs", "pub fn ok() {}");

    let archive = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root, String::from("module"))],
        &[],
        Some("group-a"),
    )
    .expect("bundle should build");

    assert_eq!(archive, out_root.join("group-a").join(ARCHIVE_NAME));
}

#[rstest]
fn repeated_runs_on_unchanged_input_produce_identical_entry_sets() {
    let out_temp = TempDir::new().expect("out dir");
    let src_temp = TempDir::new().expect("src dir");
    let out_root = utf8(&out_temp);
    let src_root = utf8(&src_temp);

    write_file(&src_root, "b.rs", "pub fn b() {}");
    write_file(&src_root, "a.rs", "pub fn a() {}");

    let first = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root.clone(), String::from("module"))],
        &[],
        None,
    )
    .expect("first bundle");
    let first_entries = archive_entry_names(&first);

    let second = generate_bundle(
        &out_root,
        &sample_invocation(),
        &[(src_root, String::from("module"))],
        &[],
        None,
    )
    .expect("second bundle");

    assert_eq!(first_entries, archive_entry_names(&second));
}

#[rstest]
#[case("src/lib.rs", true)]
#[case("project/target/debug/main", false)]
#[case("repo/.git/config", false)]
#[case("web/node_modules/pkg/index.js", false)]
#[case("pkg/sower.out/bundle/x", false)]
#[case("module/data.egg-info", false)]
fn eligibility_matches_ignored_fragments(#[case] path: &str, #[case] expected: bool) {
    assert_eq!(is_bundle_eligible(Utf8Path::new(path)), expected);
}
