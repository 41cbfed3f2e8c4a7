//! Serialised function invocations exchanged with the remote environment.
//!
//! An invocation crosses a process and machine boundary, so it is restricted
//! to JSON-compatible values: strings, numbers, booleans, null, ordered
//! lists, and string-keyed maps. The argument file written into every bundle
//! round-trips losslessly through this module.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Name of the argument file placed at the root of every bundle.
pub const ARGS_FILE_NAME: &str = "fn_args.json";

/// Errors raised while parsing or serialising invocations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InvocationError {
    /// Raised when a function identifier is not of the form `module:name`.
    #[error("malformed function identifier `{value}`: expected `module:name`")]
    MalformedId {
        /// Offending identifier text.
        value: String,
    },
    /// Raised when the argument document cannot be parsed as JSON.
    #[error("invalid argument document: {message}")]
    InvalidDocument {
        /// Parser error message.
        message: String,
    },
}

/// Composite key identifying a remote function: `module:name`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FunctionId {
    module: String,
    name: String,
}

impl FunctionId {
    /// Creates an identifier from its module and name components.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::MalformedId`] when either component is
    /// empty or contains the `:` separator.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Result<Self, InvocationError> {
        let module = module.into();
        let name = name.into();
        if module.is_empty() || name.is_empty() || module.contains(':') || name.contains(':') {
            return Err(InvocationError::MalformedId {
                value: format!("{module}:{name}"),
            });
        }
        Ok(Self { module, name })
    }

    /// Returns the module component.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Returns the function name component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.name)
    }
}

impl FromStr for FunctionId {
    type Err = InvocationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((module, name)) = value.split_once(':') else {
            return Err(InvocationError::MalformedId {
                value: value.to_owned(),
            });
        };
        Self::new(module, name)
    }
}

impl TryFrom<String> for FunctionId {
    type Error = InvocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FunctionId> for String {
    fn from(value: FunctionId) -> Self {
        value.to_string()
    }
}

impl Serialize for FunctionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FunctionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A single function call serialised for remote execution.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FunctionInvocation {
    /// Identifier of the target function.
    pub fn_id: FunctionId,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl FunctionInvocation {
    /// Creates an invocation with no arguments.
    #[must_use]
    pub fn new(fn_id: FunctionId) -> Self {
        Self {
            fn_id,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Serialises the invocation to the argument-file document.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::InvalidDocument`] when serialisation fails,
    /// which only happens for non-JSON-representable payloads.
    pub fn to_document(&self) -> Result<String, InvocationError> {
        serde_json::to_string(self).map_err(|err| InvocationError::InvalidDocument {
            message: err.to_string(),
        })
    }

    /// Parses an invocation from an argument-file document.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::InvalidDocument`] when the document is not
    /// valid JSON or does not match the expected shape.
    pub fn from_document(document: &str) -> Result<Self, InvocationError> {
        serde_json::from_str(document).map_err(|err| InvocationError::InvalidDocument {
            message: err.to_string(),
        })
    }
}
