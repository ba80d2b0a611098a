use std::cell::RefCell;
use std::rc::Rc;

use v8host::{module_status, ExecutionContext, ModuleError, SpecifierResolver};

fn read(ctx: &mut ExecutionContext, expression: &str) -> String {
    ctx.run(expression, "read.js").unwrap().stringify().unwrap()
}

#[test]
fn test_load_module_with_dependency() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.load_module("export const base = 40;", "dep", &mut SpecifierResolver)
        .unwrap();
    let result = ctx.load_module(
        "import { base } from 'dep';\nglobalThis.result = base + 2;",
        "main",
        &mut SpecifierResolver,
    );
    assert_eq!(module_status(&result), 0);
    assert_eq!(read(&mut ctx, "result"), "42");
    assert_eq!(ctx.module_names(), vec!["dep".to_string(), "main".to_string()]);
}

#[test]
fn test_resolver_sees_specifier_and_referrer() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.load_module("export default 'lib';", "lib", &mut SpecifierResolver)
        .unwrap();

    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = calls.clone();
    let mut resolver = move |specifier: &str, referrer: &str| -> Result<String, i32> {
        seen.borrow_mut()
            .push((specifier.to_string(), referrer.to_string()));
        Ok(specifier.trim_start_matches("./").to_string())
    };
    ctx.load_module(
        "import lib from './lib';\nglobalThis.name = lib;",
        "app/main",
        &mut resolver,
    )
    .unwrap();

    assert_eq!(
        calls.borrow().as_slice(),
        &[("./lib".to_string(), "app/main".to_string())]
    );
    assert_eq!(read(&mut ctx, "name"), "lib");
}

#[test]
fn test_unknown_module_status() {
    let mut ctx = ExecutionContext::new().unwrap();
    let mut resolver =
        |_specifier: &str, _referrer: &str| -> Result<String, i32> { Ok("never-loaded".into()) };
    let result = ctx.load_module("import 'anything';", "main", &mut resolver);
    assert_eq!(module_status(&result), 2);
    assert!(matches!(result, Err(ModuleError::UnknownModule(name)) if name == "never-loaded"));
    // Nothing was registered.
    assert!(ctx.module_names().is_empty());
}

#[test]
fn test_resolver_status_passes_through() {
    let mut ctx = ExecutionContext::new().unwrap();
    let mut resolver = |_: &str, _: &str| -> Result<String, i32> { Err(17) };
    let result = ctx.load_module("import 'x';", "main", &mut resolver);
    assert_eq!(module_status(&result), 17);

    let mut zero = |_: &str, _: &str| -> Result<String, i32> { Err(0) };
    let result = ctx.load_module("import 'x';", "main", &mut zero);
    assert_eq!(module_status(&result), ModuleError::STATUS_RESOLVER);
}

#[test]
fn test_cyclic_modules_link() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.declare_module(
        "import { b } from 'b';\nexport const a = 'A';\nglobalThis.both = () => a + b;",
        "a",
    )
    .unwrap();
    ctx.declare_module("import { a } from 'a';\nexport const b = 'B';", "b")
        .unwrap();

    let result = ctx.link_module("a", &mut SpecifierResolver);
    assert_eq!(module_status(&result), 0);
    assert_eq!(read(&mut ctx, "both()"), "AB");
}

#[test]
fn test_declared_dependencies_resolve_transitively() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.declare_module("export const leaf = 1;", "leaf").unwrap();
    ctx.declare_module("import { leaf } from 'leaf';\nexport const mid = leaf + 1;", "mid")
        .unwrap();

    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = calls.clone();
    let mut resolver = move |specifier: &str, referrer: &str| -> Result<String, i32> {
        seen.borrow_mut()
            .push(format!("{} <- {}", specifier, referrer));
        Ok(specifier.to_string())
    };
    ctx.load_module(
        "import { mid } from 'mid';\nglobalThis.top = mid + 1;",
        "top",
        &mut resolver,
    )
    .unwrap();

    assert_eq!(read(&mut ctx, "top"), "3");
    assert_eq!(
        calls.borrow().as_slice(),
        &["mid <- top".to_string(), "leaf <- mid".to_string()]
    );
}

#[test]
fn test_link_unknown_module() {
    let mut ctx = ExecutionContext::new().unwrap();
    let result = ctx.link_module("ghost", &mut SpecifierResolver);
    assert_eq!(module_status(&result), 2);
}

#[test]
fn test_compile_failure() {
    let mut ctx = ExecutionContext::new().unwrap();
    let err = ctx
        .load_module("export const = ;", "bad", &mut SpecifierResolver)
        .unwrap_err();
    assert_eq!(err.status(), 1);
    assert!(matches!(err, ModuleError::Compile { .. }));
    let js = err.js_error().unwrap();
    assert!(js.message.as_deref().unwrap().starts_with("SyntaxError"));
    assert!(js.location.as_deref().unwrap().starts_with("bad:1:"));
}

#[test]
fn test_missing_export_fails_instantiation() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.load_module("export const present = 1;", "dep", &mut SpecifierResolver)
        .unwrap();
    let err = ctx
        .load_module("import { absent } from 'dep';", "main", &mut SpecifierResolver)
        .unwrap_err();
    assert_eq!(err.status(), 3);
    let message = err.js_error().unwrap().message.clone().unwrap();
    assert!(message.contains("absent"), "got {}", message);
}

#[test]
fn test_evaluation_throw() {
    let mut ctx = ExecutionContext::new().unwrap();
    let err = ctx
        .load_module("throw new Error('eval failed');", "failing", &mut SpecifierResolver)
        .unwrap_err();
    assert_eq!(err.status(), 4);
    let js = err.js_error().unwrap();
    assert!(js.message.as_deref().unwrap().contains("eval failed"));
    assert!(js.stack.as_deref().unwrap().contains("eval failed"));
}

#[test]
fn test_top_level_await_rejection() {
    let mut ctx = ExecutionContext::new().unwrap();
    let err = ctx
        .load_module(
            "await Promise.resolve();\nthrow new Error('async boom');",
            "async",
            &mut SpecifierResolver,
        )
        .unwrap_err();
    assert_eq!(err.status(), 4);
    assert!(err.to_string().contains("async boom"));
}

#[test]
fn test_module_errors_do_not_poison_context() {
    let mut ctx = ExecutionContext::new().unwrap();
    let _ = ctx.load_module("throw 1;", "first", &mut SpecifierResolver);
    ctx.load_module("globalThis.ok = true;", "second", &mut SpecifierResolver)
        .unwrap();
    assert_eq!(read(&mut ctx, "ok"), "true");
}
