//! V8 embedding host
//!
//! This crate lets a host process create, drive and tear down independent V8
//! isolates through a narrow API: run scripts, load ES modules through a
//! host resolver, and push byte buffers into script code.
//!
//! # Architecture
//!
//! - [`ExecutionContext`] owns one isolate and one global context on the
//!   current thread. Values it produces are retained in an arena and handed
//!   out as [`Value`] wrappers keyed by a stable [`ValueId`].
//! - Modules are resolved in two phases: the host's [`ModuleResolver`] runs
//!   at load time and its answers are replayed when V8 instantiates.
//! - Exceptions become [`JsError`] values with message, location and stack.
//! - Script registers a callback with `V8Engine.cb(fn)`; the host pushes
//!   bytes to it with [`ExecutionContext::send`] without copying.
//! - [`spawn_context`] runs a context on a dedicated thread following the
//!   worker pattern: commands in, replies out, one at a time.
//!
//! ```no_run
//! let mut ctx = v8host::ExecutionContext::new()?;
//! let value = ctx.run("'a' + 'b'", "main.js")?;
//! assert_eq!(value.stringify()?, "ab");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod command;
mod config;
mod context;
mod error;
mod globals;
mod handle;
mod module;
mod platform;
mod spawn;
mod value;
mod worker;

pub use config::{ConfigError, ContextOptions, ENV_PREFIX};
pub use context::{ContextInfo, ExecutionContext, Value};
pub use error::{
    module_status, JsError, ModuleError, RuntimeError, SendError, TERMINATED_MESSAGE,
};
pub use handle::{ContextHandle, ValueHandle};
pub use module::{ModuleResolver, SpecifierResolver};
pub use platform::{init_platform, version};
pub use spawn::spawn_context;
pub use value::{stats, HandleStats, ValueId};

/// Re-exported so hosts can name `IsolateHandle` without depending on V8
/// directly.
pub use deno_core::v8::IsolateHandle;
