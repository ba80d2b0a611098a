//! Commands sent to the context worker thread.
//!
//! Every command that expects an answer carries a oneshot reply channel. The
//! worker handles commands one at a time, so each command owns the context
//! for its whole duration.

use tokio::sync::oneshot;

use crate::context::ContextInfo;
use crate::error::RuntimeError;
use crate::module::ModuleResolver;
use crate::value::ValueId;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

/// Resolver moved onto the worker thread with a load or link command.
pub(crate) type BoxedResolver = Box<dyn ModuleResolver + Send>;

pub(crate) enum ContextCommand {
    /// Run a classic script and keep its result.
    Run {
        source: String,
        origin: String,
        reply: Reply<ValueId>,
    },

    /// Compile, resolve, instantiate and evaluate a module.
    LoadModule {
        source: String,
        name: String,
        resolver: BoxedResolver,
        reply: Reply<()>,
    },

    /// Compile and register a module without linking it.
    DeclareModule {
        source: String,
        name: String,
        reply: Reply<()>,
    },

    /// Link and evaluate a declared module.
    LinkModule {
        name: String,
        resolver: BoxedResolver,
        reply: Reply<()>,
    },

    /// Hand a byte payload to the registered callback.
    Send {
        payload: Vec<u8>,
        reply: Reply<()>,
    },

    /// String conversion of a kept value.
    Stringify {
        id: ValueId,
        reply: Reply<String>,
    },

    /// Release a kept value. Drops send this without a reply.
    DisposeValue {
        id: ValueId,
        reply: Option<Reply<()>>,
    },

    Info {
        reply: Reply<ContextInfo>,
    },
}
