//! Execution contexts.
//!
//! An [`ExecutionContext`] owns one isolate and one global context together
//! with everything retained inside them: the host callback, the module
//! registry and the value arena. It is `!Send`; use
//! [`crate::spawn_context`] to drive a context from other threads.
//!
//! Any number of contexts may share a thread and be used or dropped in any
//! order. Each operation enters its own isolate for the duration of the call
//! and exits it again afterwards, so the isolate that was current before is
//! restored.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use deno_core::v8;
use serde::{Deserialize, Serialize};

use crate::config::ContextOptions;
use crate::error::{JsError, ModuleError, RuntimeError, SendError};
use crate::globals;
use crate::module::{self, ModuleRegistry, ModuleResolver, ResolvedSet};
use crate::platform::{init_platform, ISOLATE_CREATE_LOCK};
use crate::value::{self, TrackedBuffer, ValueArena, ValueId};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// State reachable from V8 callbacks through the isolate slot.
#[derive(Default)]
pub(crate) struct ContextState {
    /// Function registered with `cb`. Last registration wins.
    pub(crate) callback: Option<v8::Global<v8::Function>>,
    pub(crate) modules: ModuleRegistry,
}

// Field order is drop order: values, then the context, then the isolate.
struct ContextInner {
    values: ValueArena,
    context: v8::Global<v8::Context>,
    isolate: v8::OwnedIsolate,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Left entered: the remaining fields are released inside this isolate,
        // and `OwnedIsolate` exits it once more when it is dropped last.
        // SAFETY: the isolate is owned here and is disposed right after.
        unsafe { self.isolate.enter() };
        // Callback and module handles go before the context they belong to.
        self.isolate.remove_slot::<ContextState>();
    }
}

pub(crate) struct ContextShared {
    id: u64,
    inner: RefCell<ContextInner>,
    /// Values dropped while the context was busy, released on its next use.
    deferred: RefCell<Vec<ValueId>>,
}

impl ContextShared {
    fn release_deferred(&self, inner: &mut ContextInner) {
        let pending = std::mem::take(&mut *self.deferred.borrow_mut());
        for id in pending {
            inner.values.release(id);
        }
    }

    fn release(&self, id: ValueId) {
        match self.inner.try_borrow_mut() {
            Ok(mut inner) => {
                inner.entered(|inner| inner.values.release(id));
            }
            Err(_) => {
                tracing::warn!("[context:{}] Busy, deferring release of value {}", self.id, id);
                self.deferred.borrow_mut().push(id);
            }
        }
    }

    fn stringify(&self, id: ValueId) -> Result<String, RuntimeError> {
        let mut inner = self
            .inner
            .try_borrow_mut()
            .map_err(|_| RuntimeError::ContextBusy)?;
        inner.entered(|inner| {
            self.release_deferred(inner);
            inner.stringify(id)
        })
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        tracing::debug!("[context:{}] Disposed", self.id);
        value::context_dropped();
    }
}

/// One isolate with one global context.
pub struct ExecutionContext {
    shared: Rc<ContextShared>,
    isolate_handle: v8::IsolateHandle,
}

impl ExecutionContext {
    /// Create a context with default options.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_options(ContextOptions::default())
    }

    /// Create a context. No script runs.
    pub fn with_options(options: ContextOptions) -> Result<Self, RuntimeError> {
        options.validate()?;
        init_platform();

        let mut params = v8::CreateParams::default()
            .array_buffer_allocator(v8::new_default_allocator().make_shared());
        if let Some(max) = options.max_heap_size {
            params = params.heap_limits(options.initial_heap_size.unwrap_or(0), max);
        }

        let mut isolate = {
            let _lock = ISOLATE_CREATE_LOCK
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            v8::Isolate::new(params)
        };
        isolate.set_capture_stack_trace_for_uncaught_exceptions(
            options.capture_stack_traces,
            options.stack_trace_limit,
        );
        isolate.set_slot(ContextState::default());
        let isolate_handle = isolate.thread_safe_handle();

        let context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope, Default::default());
            let scope = &mut v8::ContextScope::new(scope, context);
            globals::install(scope, &options.global_name)
                .ok_or(RuntimeError::Engine("install global namespace"))?;
            v8::Global::new(scope, context)
        };
        // `Isolate::new` leaves the new isolate entered. Hand the thread back
        // to whichever isolate was current before; operations re-enter.
        // SAFETY: balances the enter performed by `Isolate::new`.
        unsafe { isolate.exit() };

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst);
        value::context_created();
        tracing::debug!("[context:{}] Created (V8 {})", id, v8::V8::get_version());

        Ok(Self {
            shared: Rc::new(ContextShared {
                id,
                inner: RefCell::new(ContextInner {
                    values: ValueArena::default(),
                    context,
                    isolate,
                }),
                deferred: RefCell::new(Vec::new()),
            }),
            isolate_handle,
        })
    }

    /// Process-unique id of this context, used in log output.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Compile and run `source` as a classic script named `origin`.
    pub fn run(&mut self, source: &str, origin: &str) -> Result<Value, JsError> {
        tracing::trace!("[context:{}] Running script '{}'", self.shared.id, origin);
        let id = self.with_inner(|inner| inner.run(source, origin))?;
        Ok(Value {
            id,
            owner: Rc::downgrade(&self.shared),
        })
    }

    /// Compile `source` as module `name`, resolve its imports through
    /// `resolver`, then instantiate and evaluate it.
    pub fn load_module(
        &mut self,
        source: &str,
        name: &str,
        resolver: &mut dyn ModuleResolver,
    ) -> Result<(), ModuleError> {
        tracing::trace!("[context:{}] Loading module '{}'", self.shared.id, name);
        let result = self.with_inner(|inner| inner.load_module(source, name, resolver));
        self.report(result)
    }

    /// Compile and register module `name` without resolving its imports.
    ///
    /// Declared modules may import each other in cycles; the whole graph is
    /// resolved when one of them is linked.
    pub fn declare_module(&mut self, source: &str, name: &str) -> Result<(), ModuleError> {
        tracing::trace!("[context:{}] Declaring module '{}'", self.shared.id, name);
        let result = self.with_inner(|inner| inner.declare_module(source, name));
        self.report(result)
    }

    /// Resolve, instantiate and evaluate a declared module.
    pub fn link_module(
        &mut self,
        name: &str,
        resolver: &mut dyn ModuleResolver,
    ) -> Result<(), ModuleError> {
        tracing::trace!("[context:{}] Linking module '{}'", self.shared.id, name);
        let result = self.with_inner(|inner| inner.link_module(name, resolver));
        self.report(result)
    }

    /// Hand `payload` to the registered callback as an `ArrayBuffer`.
    ///
    /// The buffer is moved into V8 without copying and freed when V8 collects
    /// it. Without a registered callback the payload is returned in
    /// [`SendError::NoCallback`].
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), SendError> {
        tracing::trace!("[context:{}] Sending {} bytes", self.shared.id, payload.len());
        let result = self.with_inner(|inner| inner.send(payload));
        if let Err(SendError::Callback(err)) = &result {
            tracing::error!("[context:{}] Callback threw: {:#}", self.shared.id, err);
        }
        result
    }

    /// Ask V8 for a full collection, freeing unreachable objects and the
    /// send buffers they own.
    pub fn collect_garbage(&mut self) {
        tracing::trace!("[context:{}] Collecting garbage", self.shared.id);
        self.with_inner(|inner| inner.isolate.low_memory_notification());
    }

    /// Thread-safe handle that can terminate running script from any thread.
    pub fn isolate_handle(&self) -> v8::IsolateHandle {
        self.isolate_handle.clone()
    }

    /// Names of all registered modules, sorted.
    pub fn module_names(&self) -> Vec<String> {
        self.shared
            .inner
            .borrow()
            .isolate
            .get_slot::<ContextState>()
            .map(|state| state.modules.names())
            .unwrap_or_default()
    }

    /// Whether script has registered a callback with `cb`.
    pub fn has_callback(&self) -> bool {
        self.shared
            .inner
            .borrow()
            .isolate
            .get_slot::<ContextState>()
            .is_some_and(|state| state.callback.is_some())
    }

    /// Number of values this context currently retains.
    pub fn live_values(&self) -> usize {
        self.shared.inner.borrow().values.len()
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.shared.id,
            modules: self.module_names(),
            has_callback: self.has_callback(),
            live_values: self.live_values(),
        }
    }

    /// Release every value, the callback, the modules and the context, then
    /// the isolate.
    pub fn dispose(self) {
        drop(self);
    }

    fn with_inner<T>(&mut self, f: impl FnOnce(&mut ContextInner) -> T) -> T {
        let mut inner = self.shared.inner.borrow_mut();
        inner.entered(|inner| {
            self.shared.release_deferred(inner);
            f(inner)
        })
    }

    fn report(&self, result: Result<(), ModuleError>) -> Result<(), ModuleError> {
        if let Err(err) = &result {
            match err.js_error() {
                Some(js) => tracing::error!("[context:{}] {} ({:#})", self.shared.id, err, js),
                None => tracing::error!("[context:{}] {}", self.shared.id, err),
            }
        }
        result
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a context's retained state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub id: u64,
    pub modules: Vec<String>,
    pub has_callback: bool,
    pub live_values: usize,
}

/// A value produced by [`ExecutionContext::run`].
///
/// Dropping the wrapper releases the value. Using it after its context has
/// been disposed fails with [`RuntimeError::ContextDisposed`].
pub struct Value {
    id: ValueId,
    owner: Weak<ContextShared>,
}

impl Value {
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// The value's JavaScript string conversion, `String(value)`.
    pub fn stringify(&self) -> Result<String, RuntimeError> {
        let owner = self.owner.upgrade().ok_or(RuntimeError::ContextDisposed)?;
        owner.stringify(self.id)
    }

    /// Release the value now.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.release(self.id);
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.id)
            .field("alive", &(self.owner.strong_count() > 0))
            .finish()
    }
}

fn script_origin<'s>(
    scope: &mut v8::HandleScope<'s>,
    name: v8::Local<'s, v8::String>,
    is_module: bool,
) -> v8::ScriptOrigin<'s> {
    v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        None,
        false,
        false,
        is_module,
        None,
    )
}

fn compile_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    source: &str,
    name: &str,
) -> Option<v8::Local<'s, v8::Module>> {
    let code = v8::String::new(scope, source)?;
    let resource = v8::String::new(scope, name)?;
    let origin = script_origin(scope, resource, true);
    let mut source = v8::script_compiler::Source::new(code, Some(&origin));
    v8::script_compiler::compile_module(scope, &mut source)
}

fn registered_module(scope: &mut v8::HandleScope, name: &str) -> Option<v8::Global<v8::Module>> {
    scope
        .get_slot::<ContextState>()
        .and_then(|state| state.modules.get(name).cloned())
}

fn register_module(scope: &mut v8::HandleScope, name: &str, module: v8::Local<v8::Module>) {
    let global = v8::Global::new(scope, module);
    if let Some(state) = scope.get_slot_mut::<ContextState>() {
        state.modules.insert(name, global);
    }
}

fn record_resolved(
    scope: &mut v8::HandleScope,
    module: v8::Local<v8::Module>,
    name: &str,
    dependencies: ResolvedSet,
) {
    let global = v8::Global::new(scope, module);
    if let Some(state) = scope.get_slot_mut::<ContextState>() {
        state.modules.record(name, module, global, dependencies);
    }
}

/// Ask the resolver for every import of `module`. Returns the resolved set
/// and the module names it points at.
fn resolve_imports(
    scope: &mut v8::HandleScope,
    module: v8::Local<v8::Module>,
    name: &str,
    resolver: &mut dyn ModuleResolver,
) -> Result<(ResolvedSet, Vec<String>), ModuleError> {
    let mut resolved = ResolvedSet::new();
    let mut targets = Vec::new();
    for specifier in module::module_requests(scope, module) {
        if resolved.contains_key(&specifier) {
            continue;
        }
        let target = resolver.resolve(&specifier, name).map_err(|status| {
            ModuleError::Resolver {
                specifier: specifier.clone(),
                referrer: name.to_string(),
                status: if status == 0 {
                    ModuleError::STATUS_RESOLVER
                } else {
                    status
                },
            }
        })?;
        let dependency = registered_module(scope, &target)
            .ok_or_else(|| ModuleError::UnknownModule(target.clone()))?;
        resolved.insert(specifier, dependency);
        targets.push(target);
    }
    Ok((resolved, targets))
}

/// Resolve every declared module reachable from `targets` that has no
/// resolved set yet.
fn resolve_declared(
    scope: &mut v8::HandleScope,
    targets: Vec<String>,
    resolver: &mut dyn ModuleResolver,
) -> Result<(), ModuleError> {
    let mut visited = HashSet::new();
    let mut pending = targets;
    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let global = registered_module(scope, &name)
            .ok_or_else(|| ModuleError::UnknownModule(name.clone()))?;
        let module = v8::Local::new(scope, &global);
        if module::is_resolved(scope, module) {
            continue;
        }
        let (resolved, targets) = resolve_imports(scope, module, &name, resolver)?;
        record_resolved(scope, module, &name, resolved);
        pending.extend(targets);
    }
    Ok(())
}

impl ContextInner {
    /// Run `f` with this isolate entered on the current thread.
    fn entered<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        // SAFETY: the isolate belongs to this context and the enter is
        // balanced by the exit below. Entering is a stack, so an isolate
        // entered by an enclosing call is current again afterwards.
        unsafe { self.isolate.enter() };
        let result = f(self);
        unsafe { self.isolate.exit() };
        result
    }

    fn run(&mut self, source: &str, origin: &str) -> Result<ValueId, JsError> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);

        let code = v8::String::new(tc, source)
            .ok_or_else(|| JsError::internal("Failed to allocate script source"))?;
        let resource = v8::String::new(tc, origin)
            .ok_or_else(|| JsError::internal("Failed to allocate script origin"))?;
        let origin = script_origin(tc, resource, false);

        let Some(script) = v8::Script::compile(tc, code, Some(&origin)) else {
            return Err(JsError::from_try_catch(tc));
        };
        let Some(result) = script.run(tc) else {
            return Err(JsError::from_try_catch(tc));
        };

        let global = v8::Global::new(tc, result);
        Ok(self.values.insert(global))
    }

    fn stringify(&mut self, id: ValueId) -> Result<String, RuntimeError> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);

        let value = self
            .values
            .get(id)
            .ok_or(RuntimeError::ValueDisposed(id.get()))?;
        let value = v8::Local::new(tc, value);
        match value.to_string(tc) {
            Some(string) => Ok(string.to_rust_string_lossy(tc)),
            None => Err(JsError::from_try_catch(tc).into()),
        }
    }

    fn declare_module(&mut self, source: &str, name: &str) -> Result<(), ModuleError> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);

        let Some(module) = compile_module(tc, source, name) else {
            return Err(ModuleError::Compile {
                name: name.to_string(),
                error: JsError::from_try_catch(tc),
            });
        };
        register_module(tc, name, module);
        Ok(())
    }

    fn load_module(
        &mut self,
        source: &str,
        name: &str,
        resolver: &mut dyn ModuleResolver,
    ) -> Result<(), ModuleError> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);

        let Some(module) = compile_module(tc, source, name) else {
            return Err(ModuleError::Compile {
                name: name.to_string(),
                error: JsError::from_try_catch(tc),
            });
        };

        let (resolved, targets) = resolve_imports(tc, module, name, resolver)?;
        register_module(tc, name, module);
        record_resolved(tc, module, name, resolved);
        resolve_declared(tc, targets, resolver)?;

        instantiate_and_evaluate(tc, module, name)
    }

    fn link_module(
        &mut self,
        name: &str,
        resolver: &mut dyn ModuleResolver,
    ) -> Result<(), ModuleError> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);

        let global = registered_module(tc, name)
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))?;
        let module = v8::Local::new(tc, &global);
        resolve_declared(tc, vec![name.to_string()], resolver)?;

        instantiate_and_evaluate(tc, module, name)
    }

    fn send(&mut self, payload: Vec<u8>) -> Result<(), SendError> {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);

        let callback = scope
            .get_slot::<ContextState>()
            .and_then(|state| state.callback.clone());
        let Some(callback) = callback else {
            return Err(SendError::NoCallback(payload));
        };

        let tc = &mut v8::TryCatch::new(scope);
        let callback = v8::Local::new(tc, &callback);
        let buffer = if payload.is_empty() {
            v8::ArrayBuffer::new(tc, 0)
        } else {
            // Boxing the wrapper keeps the Vec's allocation as the backing
            // store, spare capacity included. A bare Vec would be shrunk.
            let bytes = Box::new(TrackedBuffer::new(payload));
            let store = v8::ArrayBuffer::new_backing_store_from_bytes(bytes).make_shared();
            v8::ArrayBuffer::with_backing_store(tc, &store)
        };
        let receiver = context.global(tc);

        match callback.call(tc, receiver.into(), &[buffer.into()]) {
            Some(_) => Ok(()),
            None => Err(SendError::Callback(JsError::from_try_catch(tc))),
        }
    }
}

fn instantiate_and_evaluate(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    module: v8::Local<v8::Module>,
    name: &str,
) -> Result<(), ModuleError> {
    if module.instantiate_module(tc, module::resolve_callback) != Some(true) {
        return Err(ModuleError::Instantiate {
            name: name.to_string(),
            error: JsError::from_try_catch(tc),
        });
    }

    let Some(result) = module.evaluate(tc) else {
        return Err(ModuleError::Evaluate {
            name: name.to_string(),
            error: JsError::from_try_catch(tc),
        });
    };
    tc.perform_microtask_checkpoint();

    if module.get_status() == v8::ModuleStatus::Errored {
        let exception = module.get_exception();
        return Err(ModuleError::Evaluate {
            name: name.to_string(),
            error: JsError::from_exception(tc, exception),
        });
    }
    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(result) {
        if promise.state() == v8::PromiseState::Rejected {
            promise.mark_as_handled();
            let exception = promise.result(tc);
            return Err(ModuleError::Evaluate {
                name: name.to_string(),
                error: JsError::from_exception(tc, exception),
            });
        }
    }
    Ok(())
}
