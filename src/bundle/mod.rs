//! Assembly of the self-contained execution bundle.
//!
//! A bundle is a gzip-compressed tar archive holding the serialised
//! invocation, the support script, and every declared directory and file
//! copied under its archive name. The scratch directory is fully cleared
//! before the bundle subdirectory is repopulated so no state leaks between
//! invocations, and traversal is sorted so unchanged input produces a
//! byte-similar archive.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;

use crate::buildspec::SUPPORT_SCRIPT_NAME;
use crate::invocation::{ARGS_FILE_NAME, FunctionInvocation, InvocationError};

/// Path fragments that exclude a file from bundling.
///
/// Build caches, VCS and package metadata, prior output directories, and
/// dependency-install directories never belong in a bundle.
pub const BUNDLE_IGNORED_PATH_FRAGMENTS: &[&str] = &[
    "/target/",
    "/.git/",
    "/node_modules/",
    "/dist/",
    "/build/",
    "/sower.out/",
    "/__pycache__/",
    "/.venv/",
    ".egg-info",
];

/// Name of the bundle subdirectory inside the scratch directory.
pub const BUNDLE_DIR_NAME: &str = "bundle";

/// File name of the produced archive.
pub const ARCHIVE_NAME: &str = "bundle.tar.gz";

const SUPPORT_SCRIPT: &str = include_str!("../../resources/registry_login.sh");

/// Errors raised while assembling a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Raised when a declared source path does not exist.
    #[error("bundle source does not exist: {path}")]
    MissingSource {
        /// Path that could not be found.
        path: Utf8PathBuf,
    },
    /// Raised when a declared directory yields no files after filtering.
    #[error("bundle directory `{name}` ({path}) is empty after filtering")]
    EmptySource {
        /// Archive name of the directory.
        name: String,
        /// Source path of the directory.
        path: Utf8PathBuf,
    },
    /// Raised when the scratch directory cannot be prepared.
    #[error("failed to prepare scratch directory {path}: {message}")]
    Scratch {
        /// Scratch path being prepared.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when copying a source into the bundle fails.
    #[error("failed to copy {src} into bundle at {dest}: {message}")]
    Copy {
        /// Source path being copied.
        src: Utf8PathBuf,
        /// Destination inside the bundle.
        dest: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the invocation cannot be serialised.
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    /// Raised when writing the archive fails. No partial archive remains.
    #[error("failed to write bundle archive {path}: {message}")]
    Archive {
        /// Archive path being written.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
}

/// Assembles a bundle archive for `invocation` under `out_root`.
///
/// `dirs` and `files` pair a local source path with the name it takes inside
/// the bundle. An optional `bundle_group` namespaces the scratch directory so
/// concurrent dispatches sharing one process do not collide. Returns the
/// path of the finished archive.
///
/// # Errors
///
/// Returns [`BundleError`] when a source is missing, a declared directory is
/// empty after filtering, or any filesystem or archive operation fails. On
/// archive failure the partial file is removed before returning.
pub fn generate_bundle(
    out_root: &Utf8Path,
    invocation: &FunctionInvocation,
    dirs: &[(Utf8PathBuf, String)],
    files: &[(Utf8PathBuf, String)],
    bundle_group: Option<&str>,
) -> Result<Utf8PathBuf, BundleError> {
    let scratch_root = bundle_group.map_or_else(|| out_root.to_path_buf(), |group| out_root.join(group));
    let bundle_dir = scratch_root.join(BUNDLE_DIR_NAME);

    let scratch = prepare_scratch(&scratch_root)?;
    write_manifest(&scratch, invocation)?;

    for (source, name) in dirs {
        copy_filtered_dir(source, &bundle_dir, name)?;
    }
    for (source, name) in files {
        copy_file(source, &bundle_dir, name)?;
    }

    let archive_path = scratch_root.join(ARCHIVE_NAME);
    tracing::debug!(archive = %archive_path, "writing bundle archive");
    write_archive(&bundle_dir, &archive_path).map_err(|message| {
        fs::remove_file(archive_path.as_std_path()).ok();
        BundleError::Archive {
            path: archive_path.clone(),
            message,
        }
    })?;
    Ok(archive_path)
}

/// Returns `true` when `path` is free of every ignored fragment.
#[must_use]
pub fn is_bundle_eligible(path: &Utf8Path) -> bool {
    let text = path.as_str();
    BUNDLE_IGNORED_PATH_FRAGMENTS
        .iter()
        .all(|fragment| !text.contains(fragment))
}

fn prepare_scratch(scratch_root: &Utf8Path) -> Result<Dir, BundleError> {
    let scratch_err = |message: String| BundleError::Scratch {
        path: scratch_root.to_path_buf(),
        message,
    };
    fs::create_dir_all(scratch_root.as_std_path()).map_err(|err| scratch_err(err.to_string()))?;
    let scratch = Dir::open_ambient_dir(scratch_root, ambient_authority())
        .map_err(|err| scratch_err(err.to_string()))?;
    match scratch.remove_dir_all(BUNDLE_DIR_NAME) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(scratch_err(err.to_string())),
    }
    scratch
        .create_dir(BUNDLE_DIR_NAME)
        .map_err(|err| scratch_err(err.to_string()))?;
    Ok(scratch)
}

fn write_manifest(scratch: &Dir, invocation: &FunctionInvocation) -> Result<(), BundleError> {
    let document = invocation.to_document()?;
    let manifest_path = format!("{BUNDLE_DIR_NAME}/{ARGS_FILE_NAME}");
    scratch
        .write(&manifest_path, document)
        .map_err(|err| BundleError::Scratch {
            path: Utf8PathBuf::from(manifest_path.clone()),
            message: err.to_string(),
        })?;
    let script_path = format!("{BUNDLE_DIR_NAME}/{SUPPORT_SCRIPT_NAME}");
    scratch
        .write(&script_path, SUPPORT_SCRIPT)
        .map_err(|err| BundleError::Scratch {
            path: Utf8PathBuf::from(script_path),
            message: err.to_string(),
        })
}

fn copy_filtered_dir(
    source: &Utf8Path,
    bundle_dir: &Utf8Path,
    name: &str,
) -> Result<(), BundleError> {
    if !source.is_dir() {
        return Err(BundleError::MissingSource {
            path: source.to_path_buf(),
        });
    }

    let mut eligible = Vec::new();
    collect_files(source, &mut eligible).map_err(|err| BundleError::Copy {
        src: source.to_path_buf(),
        dest: bundle_dir.join(name),
        message: err.to_string(),
    })?;
    eligible.retain(|file| is_bundle_eligible(file));
    if eligible.is_empty() {
        return Err(BundleError::EmptySource {
            name: name.to_owned(),
            path: source.to_path_buf(),
        });
    }

    for file in &eligible {
        let relative = file.strip_prefix(source).map_err(|err| BundleError::Copy {
            src: file.clone(),
            dest: bundle_dir.join(name),
            message: err.to_string(),
        })?;
        let dest = bundle_dir.join(name).join(relative);
        copy_with_parents(file, &dest)?;
    }
    Ok(())
}

fn copy_file(source: &Utf8Path, bundle_dir: &Utf8Path, name: &str) -> Result<(), BundleError> {
    if !source.is_file() {
        return Err(BundleError::MissingSource {
            path: source.to_path_buf(),
        });
    }
    copy_with_parents(source, &bundle_dir.join(name))
}

fn copy_with_parents(source: &Utf8Path, dest: &Utf8Path) -> Result<(), BundleError> {
    let copy_err = |message: String| BundleError::Copy {
        src: source.to_path_buf(),
        dest: dest.to_path_buf(),
        message,
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent.as_std_path()).map_err(|err| copy_err(err.to_string()))?;
    }
    fs::copy(source.as_std_path(), dest.as_std_path())
        .map_err(|err| copy_err(err.to_string()))?;
    Ok(())
}

/// Collects every file below `root` in sorted traversal order.
fn collect_files(root: &Utf8Path, into: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
    let mut entries: Vec<Utf8PathBuf> = Vec::new();
    for entry in root.read_dir_utf8()? {
        entries.push(entry?.path().to_path_buf());
    }
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            collect_files(&entry, into)?;
        } else {
            into.push(entry);
        }
    }
    Ok(())
}

/// Collects every directory below `root` (inclusive order, sorted).
fn collect_dirs(root: &Utf8Path, into: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
    let mut entries: Vec<Utf8PathBuf> = Vec::new();
    for entry in root.read_dir_utf8()? {
        let path = entry?.path().to_path_buf();
        if path.is_dir() {
            entries.push(path);
        }
    }
    entries.sort();
    for entry in entries {
        into.push(entry.clone());
        collect_dirs(&entry, into)?;
    }
    Ok(())
}

fn write_archive(bundle_dir: &Utf8Path, archive_path: &Utf8Path) -> Result<(), String> {
    let file =
        fs::File::create(archive_path.as_std_path()).map_err(|err| err.to_string())?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_entries(&mut builder, bundle_dir).map_err(|err| err.to_string())?;

    let encoder = builder.into_inner().map_err(|err| err.to_string())?;
    encoder.finish().map_err(|err| err.to_string())?;
    Ok(())
}

fn append_entries(
    builder: &mut tar::Builder<GzEncoder<fs::File>>,
    bundle_dir: &Utf8Path,
) -> io::Result<()> {
    builder.append_dir(BUNDLE_DIR_NAME, bundle_dir.as_std_path())?;

    let mut dirs = Vec::new();
    collect_dirs(bundle_dir, &mut dirs)?;
    for dir in &dirs {
        let name = archive_entry_name(bundle_dir, dir)?;
        builder.append_dir(&name, dir.as_std_path())?;
    }

    let mut files = Vec::new();
    collect_files(bundle_dir, &mut files)?;
    for file in &files {
        let name = archive_entry_name(bundle_dir, file)?;
        builder.append_path_with_name(file.as_std_path(), &name)?;
    }
    Ok(())
}

fn archive_entry_name(bundle_dir: &Utf8Path, path: &Utf8Path) -> io::Result<String> {
    let relative = path
        .strip_prefix(bundle_dir)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    Ok(format!("{BUNDLE_DIR_NAME}/{relative}"))
}

#[cfg(test)]
mod tests;
