use std::sync::Arc;
use std::time::Duration;

use v8host::{
    spawn_context, ContextOptions, ModuleError, RuntimeError, SendError, SpecifierResolver,
};

#[tokio::test]
async fn test_run_and_stringify() {
    let handle = spawn_context("handle-run", ContextOptions::default()).unwrap();
    let value = handle.run("[1, 2, 3].map((n) => n * 2)", "map.js").await.unwrap();
    assert_eq!(value.stringify().await.unwrap(), "2,4,6");
    handle.dispose().unwrap();
}

#[tokio::test]
async fn test_script_error_crosses_thread() {
    let handle = spawn_context("handle-error", ContextOptions::default()).unwrap();
    match handle.run("throw new TypeError('wrong')", "error.js").await {
        Err(RuntimeError::JavaScript(err)) => {
            assert_eq!(err.message.as_deref(), Some("TypeError: wrong"));
            assert_eq!(err.location.as_deref(), Some("error.js:1:1"));
        }
        other => panic!("expected a JavaScript error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_value_drop_releases_on_worker() {
    let handle = spawn_context("handle-values", ContextOptions::default()).unwrap();
    let kept = handle.run("'kept'", "kept.js").await.unwrap();
    {
        let _dropped = handle.run("'dropped'", "dropped.js").await.unwrap();
    }
    // Commands are handled in order, so the release has been applied.
    assert_eq!(handle.info().await.unwrap().live_values, 1);

    kept.dispose().await.unwrap();
    assert_eq!(handle.info().await.unwrap().live_values, 0);
}

#[tokio::test]
async fn test_modules_through_handle() {
    let handle = spawn_context("handle-modules", ContextOptions::default()).unwrap();
    handle
        .declare_module(
            "import { pong } from 'pong';\nexport const ping = () => 'ping' + pong();",
            "ping",
        )
        .await
        .unwrap();
    handle
        .declare_module(
            "import { ping } from 'ping';\nexport const pong = () => 'pong';",
            "pong",
        )
        .await
        .unwrap();
    handle.link_module("ping", SpecifierResolver).await.unwrap();

    let resolver = |specifier: &str, _referrer: &str| -> Result<String, i32> {
        Ok(specifier.to_string())
    };
    handle
        .load_module(
            "import { ping } from 'ping';\nglobalThis.answer = ping();",
            "main",
            resolver,
        )
        .await
        .unwrap();

    let value = handle.run("answer", "answer.js").await.unwrap();
    assert_eq!(value.stringify().await.unwrap(), "pingpong");
    assert_eq!(
        handle.info().await.unwrap().modules,
        vec!["main".to_string(), "ping".to_string(), "pong".to_string()]
    );

    match handle.link_module("missing", SpecifierResolver).await {
        Err(RuntimeError::Module(err)) => {
            assert!(matches!(err, ModuleError::UnknownModule(_)));
            assert_eq!(err.status(), 2);
        }
        other => panic!("expected a module error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_through_handle() {
    let handle = spawn_context("handle-send", ContextOptions::default()).unwrap();

    match handle.send(vec![4, 5, 6]).await {
        Err(RuntimeError::Send(SendError::NoCallback(payload))) => {
            assert_eq!(payload, vec![4, 5, 6])
        }
        other => panic!("expected no callback, got {:?}", other),
    }

    handle
        .run(
            "V8Engine.cb((buf) => { globalThis.got = new Uint8Array(buf).join('-'); })",
            "cb.js",
        )
        .await
        .unwrap();
    handle.send(vec![4, 5, 6]).await.unwrap();
    let value = handle.run("got", "got.js").await.unwrap();
    assert_eq!(value.stringify().await.unwrap(), "4-5-6");
    assert!(handle.info().await.unwrap().has_callback);
}

#[tokio::test]
async fn test_terminate_execution_keeps_context_usable() {
    let handle = spawn_context("handle-terminate", ContextOptions::default()).unwrap();
    let (result, ()) = tokio::join!(handle.run("while (true) {}", "spin.js"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate_execution();
    });

    match result {
        Err(RuntimeError::JavaScript(err)) => assert!(err.is_terminated()),
        other => panic!("expected termination, got {:?}", other),
    }

    let value = handle.run("'alive'", "after.js").await.unwrap();
    assert_eq!(value.stringify().await.unwrap(), "alive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_from_many_tasks_are_serialized() {
    let handle = Arc::new(spawn_context("handle-concurrent", ContextOptions::default()).unwrap());
    handle.run("globalThis.n = 0", "init.js").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .run("n = n + 1; n", format!("task-{}.js", i))
                .await
                .unwrap()
                .stringify()
                .await
                .unwrap()
        }));
    }

    let mut seen = Vec::new();
    for task in tasks {
        seen.push(task.await.unwrap().parse::<u32>().unwrap());
    }
    seen.sort();
    assert_eq!(seen, (1..=16).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_operations_after_dispose_fail_fast() {
    let handle = spawn_context("handle-dispose", ContextOptions::default()).unwrap();
    let value = handle.run("'soon gone'", "value.js").await.unwrap();
    handle.dispose().unwrap();

    assert!(matches!(
        value.stringify().await,
        Err(RuntimeError::ContextDisposed)
    ));
    assert!(matches!(value.dispose().await, Err(RuntimeError::ContextDisposed)));
}

#[test]
fn test_spawn_rejects_invalid_options() {
    let options = ContextOptions {
        global_name: String::new(),
        ..Default::default()
    };
    assert!(matches!(
        spawn_context("handle-invalid", options),
        Err(RuntimeError::Config(_))
    ));
}

#[test]
fn test_worker_thread_is_named() {
    let handle = spawn_context("named-worker", ContextOptions::default()).unwrap();
    assert_eq!(handle.name(), "named-worker");
    assert!(!handle.is_disposed());
    drop(handle);
}
