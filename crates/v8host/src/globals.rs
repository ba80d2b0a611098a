//! The global namespace object installed in every context.
//!
//! ```js
//! V8Engine.print("to", "stdout");
//! V8Engine.log("to", "stderr");
//! V8Engine.cb((buf) => { /* receives every host send */ });
//! ```

use std::io::Write;

use deno_core::v8;

use crate::context::ContextState;

/// Install the namespace object as `global_name` on the current context's
/// global object. Returns `None` if V8 could not allocate it.
pub(crate) fn install(scope: &mut v8::HandleScope, global_name: &str) -> Option<()> {
    let namespace = v8::Object::new(scope);
    set_function(scope, namespace, "print", print)?;
    set_function(scope, namespace, "log", log)?;
    set_function(scope, namespace, "cb", register_callback)?;

    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, global_name)?;
    global.set(scope, key.into(), namespace.into())?;
    Some(())
}

fn set_function(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Option<()> {
    let key = v8::String::new(scope, name)?;
    let function = v8::Function::new(scope, callback)?;
    target.set(scope, key.into(), function.into())?;
    Some(())
}

/// Space-join the string forms of every argument.
fn join_args(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) -> String {
    let mut line = String::new();
    for i in 0..args.length() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&args.get(i).to_rust_string_lossy(scope));
    }
    line
}

fn print(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let line = join_args(scope, &args);
    tracing::trace!("[script] print: {}", line);
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn log(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let line = join_args(scope, &args);
    tracing::trace!("[script] log: {}", line);
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", line);
    let _ = stderr.flush();
}

/// `cb(fn)`: replace the context's host callback.
fn register_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let function = if args.length() == 1 {
        v8::Local::<v8::Function>::try_from(args.get(0)).ok()
    } else {
        None
    };
    let Some(function) = function else {
        throw_type_error(scope, "cb expects exactly one function argument");
        return;
    };

    let callback = v8::Global::new(scope, function);
    if let Some(state) = scope.get_slot_mut::<ContextState>() {
        if state.callback.replace(callback).is_some() {
            tracing::trace!("[script] Replaced host callback");
        }
    }
}

fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
    }
}
