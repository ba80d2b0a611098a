//! Error types and exception translation.
//!
//! [`JsError`] is the boundary-safe form of a V8 exception. It is only ever
//! built from an exception that is in flight on a `TryCatch` scope, or from
//! the exception a module recorded when its evaluation failed.

use std::fmt;

use deno_core::v8;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Message reported when the isolate was asked to stop executing.
pub const TERMINATED_MESSAGE: &str = "ExecutionTerminated: script execution has been terminated";

/// A JavaScript exception translated into three optional text fields.
///
/// `None` means the field was not available. An empty string produced by the
/// engine is kept as `Some("")`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsError {
    /// String form of the thrown value, e.g. `Error: boom`.
    pub message: Option<String>,
    /// `resource:line:column`, with a 1-based column.
    pub location: Option<String>,
    /// Stack trace, when the engine produced one.
    pub stack: Option<String>,
}

impl JsError {
    /// The fixed error reported for a terminated execution.
    pub fn terminated() -> Self {
        Self {
            message: Some(TERMINATED_MESSAGE.to_string()),
            location: None,
            stack: None,
        }
    }

    /// Whether this error reports a terminated execution.
    pub fn is_terminated(&self) -> bool {
        self.message.as_deref() == Some(TERMINATED_MESSAGE) && self.location.is_none()
    }

    /// An error raised by the embedding itself rather than by script code.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            location: None,
            stack: None,
        }
    }

    /// Translate the exception caught by `tc`.
    ///
    /// Termination is reported with [`TERMINATED_MESSAGE`] and the isolate's
    /// termination state is cancelled so later calls can run.
    pub(crate) fn from_try_catch(tc: &mut v8::TryCatch<v8::HandleScope>) -> Self {
        if tc.has_terminated() || tc.is_execution_terminating() {
            tc.cancel_terminate_execution();
            return Self::terminated();
        }

        let message = tc.exception().map(|exception| exception.to_rust_string_lossy(tc));
        let location = tc.message().map(|msg| message_location(tc, msg));
        let stack = tc.stack_trace().map(|stack| stack.to_rust_string_lossy(tc));

        Self {
            message,
            location,
            stack,
        }
    }

    /// Translate an exception value that is no longer in flight, such as the
    /// one recorded by a module whose evaluation failed.
    pub(crate) fn from_exception(
        scope: &mut v8::HandleScope,
        exception: v8::Local<v8::Value>,
    ) -> Self {
        let message = Some(exception.to_rust_string_lossy(scope));
        let msg = v8::Exception::create_message(scope, exception);
        let location = Some(message_location(scope, msg));
        let stack = stack_property(scope, exception);

        Self {
            message,
            location,
            stack,
        }
    }
}

impl fmt::Display for JsError {
    /// `{}` prints the message; `{:#}` prints the stack trace when present.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            if let Some(stack) = self.stack.as_deref().filter(|s| !s.is_empty()) {
                return f.write_str(stack);
            }
        }
        f.write_str(self.message.as_deref().unwrap_or("unknown JavaScript error"))
    }
}

impl std::error::Error for JsError {}

/// Format `resource:line:column` for a message object.
fn message_location(scope: &mut v8::HandleScope, msg: v8::Local<v8::Message>) -> String {
    let resource = msg
        .get_script_resource_name(scope)
        .map(|name| name.to_rust_string_lossy(scope))
        .unwrap_or_default();
    let line = msg.get_line_number(scope);
    format_location(&resource, line, Some(msg.get_start_column()))
}

/// Build a location string. `start_column` is 0-based as V8 reports it and is
/// printed 1-based to match stack trace output.
pub(crate) fn format_location(
    resource: &str,
    line: Option<usize>,
    start_column: Option<usize>,
) -> String {
    let mut location = resource.to_string();
    if let Some(line) = line {
        location.push_str(&format!(":{}", line));
    }
    if let Some(column) = start_column {
        location.push_str(&format!(":{}", column + 1));
    }
    location
}

/// Read the `stack` property of a thrown object, if it has a usable one.
fn stack_property(
    scope: &mut v8::HandleScope,
    exception: v8::Local<v8::Value>,
) -> Option<String> {
    let object = v8::Local::<v8::Object>::try_from(exception).ok()?;
    let key = v8::String::new(scope, "stack")?;
    let stack = object.get(scope, key.into())?;
    if stack.is_null_or_undefined() {
        return None;
    }
    Some(stack.to_rust_string_lossy(scope))
}

/// Failure of a module load, declare or link.
///
/// [`ModuleError::status`] maps each variant onto the stable integer codes
/// hosts use to tell failures apart.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    #[error("Module '{name}' failed to compile: {error}")]
    Compile { name: String, error: JsError },

    #[error("Resolver failed for '{specifier}' imported by '{referrer}' (status {status})")]
    Resolver {
        specifier: String,
        referrer: String,
        status: i32,
    },

    #[error("Module '{0}' is not registered")]
    UnknownModule(String),

    #[error("Module '{name}' failed to instantiate: {error}")]
    Instantiate { name: String, error: JsError },

    #[error("Module '{name}' failed to evaluate: {error}")]
    Evaluate { name: String, error: JsError },
}

impl ModuleError {
    pub const STATUS_RESOLVER: i32 = 1;
    pub const STATUS_UNKNOWN_MODULE: i32 = 2;
    pub const STATUS_INSTANTIATE: i32 = 3;
    pub const STATUS_EVALUATE: i32 = 4;

    /// Integer status of this failure. Resolver statuses pass through as-is.
    pub fn status(&self) -> i32 {
        match self {
            Self::Compile { .. } => Self::STATUS_RESOLVER,
            Self::Resolver { status, .. } => *status,
            Self::UnknownModule(_) => Self::STATUS_UNKNOWN_MODULE,
            Self::Instantiate { .. } => Self::STATUS_INSTANTIATE,
            Self::Evaluate { .. } => Self::STATUS_EVALUATE,
        }
    }

    /// The translated exception behind this failure, if there was one.
    pub fn js_error(&self) -> Option<&JsError> {
        match self {
            Self::Compile { error, .. }
            | Self::Instantiate { error, .. }
            | Self::Evaluate { error, .. } => Some(error),
            Self::Resolver { .. } | Self::UnknownModule(_) => None,
        }
    }
}

/// Status of a module operation: `0` on success, otherwise
/// [`ModuleError::status`].
pub fn module_status(result: &Result<(), ModuleError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.status(),
    }
}

/// Failure of [`crate::ExecutionContext::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No callback was registered. The payload is handed back untouched.
    #[error("No callback registered")]
    NoCallback(Vec<u8>),

    #[error("Callback threw: {0}")]
    Callback(JsError),
}

impl SendError {
    pub const STATUS_NO_CALLBACK: i32 = 2;
    pub const STATUS_CALLBACK: i32 = 3;

    /// Integer status of this failure.
    pub fn status(&self) -> i32 {
        match self {
            Self::NoCallback(_) => Self::STATUS_NO_CALLBACK,
            Self::Callback(_) => Self::STATUS_CALLBACK,
        }
    }

    /// Recover the payload of a send that found no callback.
    pub fn into_payload(self) -> Option<Vec<u8>> {
        match self {
            Self::NoCallback(payload) => Some(payload),
            Self::Callback(_) => None,
        }
    }
}

/// Errors that can occur in the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The owning context was disposed. Using a value after its context is
    /// gone is a contract violation; this is the fail-fast guard for it.
    #[error("Context has been disposed")]
    ContextDisposed,

    #[error("Context is busy with another operation")]
    ContextBusy,

    #[error("Value {0} has been disposed")]
    ValueDisposed(u64),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("V8 failed to {0}")]
    Engine(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JavaScript error: {0}")]
    JavaScript(#[from] JsError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Send(#[from] SendError),
}
