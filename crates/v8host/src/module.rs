//! Module registry and dependency resolution.
//!
//! Resolution is two-phase. At load time the host's [`ModuleResolver`] maps
//! every import specifier to a registered module name, and the answers are
//! recorded per module. During instantiation V8 calls
//! [`resolve_callback`] synchronously, which only replays those recorded
//! answers and never calls back into the host.

use std::collections::HashMap;

use deno_core::v8;

use crate::context::ContextState;

/// Host-supplied module resolution.
///
/// Given an import `specifier` and the name of the importing module, return
/// the name of an already registered module, or a non-zero status that is
/// reported to the caller unchanged.
pub trait ModuleResolver {
    fn resolve(&mut self, specifier: &str, referrer: &str) -> Result<String, i32>;
}

impl<F> ModuleResolver for F
where
    F: FnMut(&str, &str) -> Result<String, i32>,
{
    fn resolve(&mut self, specifier: &str, referrer: &str) -> Result<String, i32> {
        self(specifier, referrer)
    }
}

/// Resolves every specifier to the module registered under that exact name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecifierResolver;

impl ModuleResolver for SpecifierResolver {
    fn resolve(&mut self, specifier: &str, _referrer: &str) -> Result<String, i32> {
        Ok(specifier.to_string())
    }
}

/// Specifier → module map computed for one module at load time.
pub(crate) type ResolvedSet = HashMap<String, v8::Global<v8::Module>>;

struct ResolvedModule {
    name: String,
    module: v8::Global<v8::Module>,
    dependencies: ResolvedSet,
}

/// Per-context module state: name → module, identity → resolved set.
///
/// Identity hashes are not unique, so each bucket keeps the module handle
/// next to its resolved set and lookups compare handles.
#[derive(Default)]
pub(crate) struct ModuleRegistry {
    modules: HashMap<String, v8::Global<v8::Module>>,
    resolved: HashMap<i32, Vec<ResolvedModule>>,
}

impl ModuleRegistry {
    pub(crate) fn get(&self, name: &str) -> Option<&v8::Global<v8::Module>> {
        self.modules.get(name)
    }

    /// Register `module` under `name`. A module previously registered under
    /// the same name is unregistered along with its resolved set.
    pub(crate) fn insert(&mut self, name: &str, module: v8::Global<v8::Module>) {
        if self.modules.insert(name.to_string(), module).is_some() {
            tracing::debug!("[modules] Replaced module '{}'", name);
            self.resolved.retain(|_, bucket| {
                bucket.retain(|entry| entry.name != name);
                !bucket.is_empty()
            });
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Record the resolved set of `module`, registered as `name`, under its
    /// identity hash.
    pub(crate) fn record(
        &mut self,
        name: &str,
        module: v8::Local<v8::Module>,
        global: v8::Global<v8::Module>,
        dependencies: ResolvedSet,
    ) {
        let bucket = self
            .resolved
            .entry(module.get_identity_hash().get())
            .or_default();
        bucket.push(ResolvedModule {
            name: name.to_string(),
            module: global,
            dependencies,
        });
    }

    #[cfg(test)]
    pub(crate) fn resolved_len(&self) -> usize {
        self.resolved.values().map(Vec::len).sum()
    }

    /// Candidates sharing `module`'s identity hash, each with its answer for
    /// `specifier` (if any).
    fn bucket(
        &self,
        module: v8::Local<v8::Module>,
        specifier: Option<&str>,
    ) -> Vec<(v8::Global<v8::Module>, Option<v8::Global<v8::Module>>)> {
        self.resolved
            .get(&module.get_identity_hash().get())
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|entry| {
                        let dependency = specifier
                            .and_then(|specifier| entry.dependencies.get(specifier).cloned());
                        (entry.module.clone(), dependency)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Whether `module` already has a recorded resolved set.
pub(crate) fn is_resolved(scope: &mut v8::HandleScope, module: v8::Local<v8::Module>) -> bool {
    let candidates = match scope.get_slot::<ContextState>() {
        Some(state) => state.modules.bucket(module, None),
        None => return false,
    };
    candidates
        .iter()
        .any(|(candidate, _)| v8::Local::new(scope, candidate) == module)
}

/// Static import specifiers of `module`, in source order.
pub(crate) fn module_requests(
    scope: &mut v8::HandleScope,
    module: v8::Local<v8::Module>,
) -> Vec<String> {
    let requests = module.get_module_requests();
    let mut specifiers = Vec::with_capacity(requests.length());
    for i in 0..requests.length() {
        let Some(data) = requests.get(scope, i) else {
            continue;
        };
        let Ok(request) = v8::Local::<v8::ModuleRequest>::try_from(data) else {
            continue;
        };
        specifiers.push(request.get_specifier().to_rust_string_lossy(scope));
    }
    specifiers
}

/// Resolve callback handed to `Module::instantiate_module`.
///
/// Looks up the referrer's recorded resolved set. An unknown referrer or a
/// specifier missing from its set throws, which V8 reports as an
/// instantiation failure.
pub(crate) fn resolve_callback<'a>(
    context: v8::Local<'a, v8::Context>,
    specifier: v8::Local<'a, v8::String>,
    _import_attributes: v8::Local<'a, v8::FixedArray>,
    referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
    // SAFETY: V8 invokes this callback from inside `instantiate_module`, with
    // `context` entered on the current thread.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let specifier = specifier.to_rust_string_lossy(scope);

    let candidates = scope
        .get_slot::<ContextState>()
        .map(|state| state.modules.bucket(referrer, Some(&specifier)))
        .unwrap_or_default();

    let mut referrer_known = false;
    for (candidate, dependency) in candidates {
        if v8::Local::new(scope, &candidate) != referrer {
            continue;
        }
        referrer_known = true;
        if let Some(dependency) = dependency {
            return Some(v8::Local::new(scope, &dependency));
        }
    }

    let reason = if referrer_known {
        format!("Cannot resolve module '{}': not in the importer's resolved set", specifier)
    } else {
        format!("Cannot resolve module '{}': importer has no resolved set", specifier)
    };
    tracing::trace!("[modules] {}", reason);
    if let Some(message) = v8::String::new(scope, &reason) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }
    None
}
