//! Remote-side execution of a bundled invocation.
//!
//! Inside the seedbed the bundle's entrypoint re-enters this module: the
//! argument file is read, the target callable is resolved by its string
//! identifier in a [`FunctionTable`], and a non-null return value is
//! persisted as a shell-sourceable export so the surrounding build phases
//! can forward it out of band.
//!
//! The table is the crate's one deliberate dynamic-dispatch boundary: any
//! callable matching the invocation contract can be registered under a
//! string identifier and resolved at remote-execution time.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::invocation::{FunctionId, FunctionInvocation, InvocationError};

/// Environment variable carrying the serialised return value out of the
/// remote execution.
pub const OUTPUT_ENV_VAR: &str = "SOWER_OUTPUT";

/// Error type callables may fail with.
pub type CallableError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A function invocable through the remote execution harness.
///
/// Callables receive the deserialised positional and keyword arguments and
/// return an optional JSON value; `None` means there is nothing to export.
pub type RemoteCallable =
    Arc<dyn Fn(&[Value], &Map<String, Value>) -> Result<Option<Value>, CallableError> + Send + Sync>;

/// Errors raised while executing on the remote side.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Raised when the argument file cannot be read.
    #[error("failed to read argument file {path}: {message}")]
    ArgsFileRead {
        /// Path of the argument file.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the argument document is malformed.
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    /// Raised when no callable is registered under the requested identifier.
    #[error("no function registered for identifier `{fn_id}`")]
    UnknownFunction {
        /// Identifier that could not be resolved.
        fn_id: FunctionId,
    },
    /// Raised when the resolved callable fails; this aborts the build phase.
    #[error("remote function `{fn_id}` failed: {message}")]
    Function {
        /// Identifier of the failing callable.
        fn_id: FunctionId,
        /// Error reported by the callable.
        message: String,
    },
    /// Raised when the export file cannot be written.
    #[error("failed to write export file {path}: {message}")]
    ExportWrite {
        /// Path of the export file.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Registry of callables resolvable by string identifier.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, RemoteCallable>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callable` under `fn_id`, replacing any prior registration.
    pub fn register(&mut self, fn_id: &FunctionId, callable: RemoteCallable) {
        self.functions.insert(fn_id.to_string(), callable);
    }

    /// Resolves the callable registered under `fn_id`.
    #[must_use]
    pub fn resolve(&self, fn_id: &FunctionId) -> Option<RemoteCallable> {
        self.functions.get(&fn_id.to_string()).cloned()
    }

    /// Returns the registered identifiers in sorted order.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }
}

/// Executes the invocation described by the argument file at `args_file`.
///
/// A non-null return value is written to `export_file` before this function
/// returns. Callable failures propagate so the surrounding build phase
/// observes a failing command.
///
/// # Errors
///
/// Returns [`RunnerError`] when the file cannot be read, the invocation is
/// malformed, the identifier is unknown, the callable fails, or the export
/// cannot be written.
pub fn execute_args_file(
    table: &FunctionTable,
    args_file: &Utf8Path,
    export_file: &Utf8Path,
) -> Result<Option<Value>, RunnerError> {
    let document = read_to_string_ambient(args_file).map_err(|message| {
        RunnerError::ArgsFileRead {
            path: args_file.to_string(),
            message,
        }
    })?;
    let invocation = FunctionInvocation::from_document(&document)?;
    tracing::info!(fn_id = %invocation.fn_id, "executing remote function");

    let callable =
        table
            .resolve(&invocation.fn_id)
            .ok_or_else(|| RunnerError::UnknownFunction {
                fn_id: invocation.fn_id.clone(),
            })?;
    let result = callable.as_ref()(&invocation.args, &invocation.kwargs).map_err(|err| {
        RunnerError::Function {
            fn_id: invocation.fn_id.clone(),
            message: err.to_string(),
        }
    })?;

    if let Some(value) = &result {
        tracing::debug!(export = %export_file, "writing result export file");
        write_export_file(export_file, value)?;
    }
    Ok(result)
}

/// Writes `value` to `path` as a shell-sourceable export declaration.
///
/// The declaration uses a quoted heredoc so the JSON payload needs no shell
/// escaping:
///
/// ```text
/// read -r -d '' SOWER_OUTPUT <<'EOF'
/// {json}
/// EOF
/// export SOWER_OUTPUT
/// ```
///
/// # Errors
///
/// Returns [`RunnerError::ExportWrite`] when serialisation or the write
/// fails.
pub fn write_export_file(path: &Utf8Path, value: &Value) -> Result<(), RunnerError> {
    let export_err = |message: String| RunnerError::ExportWrite {
        path: path.to_string(),
        message,
    };
    let payload = serde_json::to_string(value).map_err(|err| export_err(err.to_string()))?;
    let content =
        format!("read -r -d '' {OUTPUT_ENV_VAR} <<'EOF'\n{payload}\nEOF\nexport {OUTPUT_ENV_VAR}\n");

    let (dir_path, file_name) = split_ambient(path).map_err(export_err)?;
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|err| export_err(err.to_string()))?;
    dir.write(file_name, content)
        .map_err(|err| export_err(err.to_string()))
}

fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (dir_path, file_name) = split_ambient(path)?;
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_name).map_err(|err| err.to_string())
}

fn split_ambient(path: &Utf8Path) -> Result<(&Utf8Path, &Utf8Path), String> {
    if path.is_absolute() {
        let parent = path
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path}"))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path}"))?;
        Ok((parent, Utf8Path::new(file_name)))
    } else {
        Ok((Utf8Path::new("."), path))
    }
}

/// Command surface embedded in the caller's entrypoint binary.
///
/// The generated build phase invokes the entrypoint as
/// `<entrypoint> execute --args-file fn_args.json --debug`; embedding
/// applications parse their process arguments with this type and hand over
/// their [`FunctionTable`].
#[derive(Debug, Parser)]
#[command(name = "sower-runner", about = "Execute a bundled remote function inside a seedbed")]
pub enum RunnerCli {
    /// Execute the function described by an argument file.
    #[command(name = "execute")]
    Execute(ExecuteCommand),
}

/// Arguments for the `execute` subcommand.
#[derive(Debug, Parser)]
pub struct ExecuteCommand {
    /// Path of the JSON argument file.
    #[arg(long = "args-file", value_name = "PATH")]
    pub args_file: camino::Utf8PathBuf,
    /// Enable detailed logging.
    #[arg(long)]
    pub debug: bool,
}

impl RunnerCli {
    /// Parses the process arguments and executes the requested command.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when execution fails; argument parsing errors
    /// terminate the process through clap's standard handling.
    pub fn run(
        table: &FunctionTable,
        export_file: &Utf8Path,
    ) -> Result<Option<Value>, RunnerError> {
        Self::parse().dispatch(table, export_file)
    }

    /// Executes an already parsed command.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when execution fails.
    pub fn dispatch(
        self,
        table: &FunctionTable,
        export_file: &Utf8Path,
    ) -> Result<Option<Value>, RunnerError> {
        match self {
            Self::Execute(command) => {
                init_subscriber(command.debug);
                execute_args_file(table, &command.args_file, export_file)
            }
        }
    }
}

fn init_subscriber(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn utf8(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("temp path should be UTF-8")
    }

    fn echo_table() -> FunctionTable {
        let mut table = FunctionTable::new();
        let fn_id: FunctionId = "pkg.tasks:echo".parse().expect("id");
        table.register(
            &fn_id,
            Arc::new(|args, kwargs| {
                Ok(Some(json!({"args": args, "kwargs": kwargs})))
            }),
        );
        table
    }

    #[rstest]
    fn executes_and_reproduces_arguments_exactly() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8(&temp);
        let args_file = root.join("fn_args.json");
        let export_file = root.join("export.sh");

        let mut kwargs = Map::new();
        kwargs.insert(String::from("k"), json!({"nested": [1, 2.5, false, null]}));
        let invocation = FunctionInvocation {
            fn_id: "pkg.tasks:echo".parse().expect("id"),
            args: vec![json!("a"), json!(3)],
            kwargs: kwargs.clone(),
        };
        std::fs::write(
            args_file.as_std_path(),
            invocation.to_document().expect("document"),
        )
        .expect("write args file");

        let result = execute_args_file(&echo_table(), &args_file, &export_file)
            .expect("execution should succeed")
            .expect("result should be present");

        assert_eq!(
            result,
            json!({"args": ["a", 3], "kwargs": {"k": {"nested": [1, 2.5, false, null]}}})
        );
    }

    #[rstest]
    fn unknown_identifier_is_an_error() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8(&temp);
        let args_file = root.join("fn_args.json");

        let invocation = FunctionInvocation::new("pkg.tasks:absent".parse().expect("id"));
        std::fs::write(
            args_file.as_std_path(),
            invocation.to_document().expect("document"),
        )
        .expect("write args file");

        let err = execute_args_file(&echo_table(), &args_file, &root.join("export.sh"))
            .expect_err("unknown identifier should fail");

        assert!(matches!(err, RunnerError::UnknownFunction { .. }));
    }

    #[rstest]
    fn callable_failure_propagates() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8(&temp);
        let args_file = root.join("fn_args.json");

        let mut table = FunctionTable::new();
        let fn_id: FunctionId = "pkg.tasks:boom".parse().expect("id");
        table.register(
            &fn_id,
            Arc::new(|_, _| Err(CallableError::from("deliberate failure"))),
        );
        let invocation = FunctionInvocation::new(fn_id);
        std::fs::write(
            args_file.as_std_path(),
            invocation.to_document().expect("document"),
        )
        .expect("write args file");

        let err = execute_args_file(&table, &args_file, &root.join("export.sh"))
            .expect_err("callable failure should propagate");

        assert!(
            matches!(err, RunnerError::Function { ref message, .. } if message.contains("deliberate")),
            "unexpected error: {err}"
        );
    }

    #[rstest]
    fn export_file_declares_the_output_variable_via_heredoc() {
        let temp = TempDir::new().expect("temp dir");
        let export_file = utf8(&temp).join("export.sh");

        write_export_file(&export_file, &json!("hello")).expect("export should write");

        let content =
            std::fs::read_to_string(export_file.as_std_path()).expect("read export file");
        assert_eq!(
            content,
            "read -r -d '' SOWER_OUTPUT <<'EOF'\n\"hello\"\nEOF\nexport SOWER_OUTPUT\n"
        );
    }

    #[rstest]
    fn null_result_writes_no_export_file() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8(&temp);
        let args_file = root.join("fn_args.json");
        let export_file = root.join("export.sh");

        let mut table = FunctionTable::new();
        let fn_id: FunctionId = "pkg.tasks:silent".parse().expect("id");
        table.register(&fn_id, Arc::new(|_, _| Ok(None)));
        let invocation = FunctionInvocation::new(fn_id);
        std::fs::write(
            args_file.as_std_path(),
            invocation.to_document().expect("document"),
        )
        .expect("write args file");

        let result = execute_args_file(&table, &args_file, &export_file)
            .expect("execution should succeed");

        assert_eq!(result, None);
        assert!(!export_file.exists(), "no export file expected");
    }

    #[rstest]
    fn last_registration_wins_in_the_table() {
        let mut table = FunctionTable::new();
        let fn_id: FunctionId = "pkg.tasks:dup".parse().expect("id");
        table.register(&fn_id, Arc::new(|_, _| Ok(Some(json!(1)))));
        table.register(&fn_id, Arc::new(|_, _| Ok(Some(json!(2)))));

        let callable = table.resolve(&fn_id).expect("callable should resolve");
        let result = callable.as_ref()(&[], &Map::new()).expect("callable should succeed");

        assert_eq!(result, Some(json!(2)));
    }
}
