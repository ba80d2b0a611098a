//! Process-wide V8 bootstrap.
//!
//! The platform is initialized once and never torn down. Every isolate in the
//! process shares it.

use std::sync::Mutex;
use std::sync::Once;

use deno_core::v8;
use deno_core::JsRuntime;

/// Ensure V8 platform is initialized exactly once.
static V8_INIT: Once = Once::new();

/// Mutex to serialize V8 isolate creation.
/// Creating multiple isolates concurrently can cause crashes in V8.
pub(crate) static ISOLATE_CREATE_LOCK: Mutex<()> = Mutex::new(());

/// Initialize the V8 platform. Call this before creating any context.
/// Safe to call multiple times - will only initialize once.
pub fn init_platform() {
    V8_INIT.call_once(|| {
        tracing::debug!("[platform] Initializing V8 {}", v8::V8::get_version());
        JsRuntime::init_platform(None, false);
    });
}

/// Version string of the embedded V8 engine.
pub fn version() -> &'static str {
    v8::V8::get_version()
}
