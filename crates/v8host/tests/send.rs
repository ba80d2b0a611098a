use v8host::{ExecutionContext, SendError};

const RECORDER: &str = r#"
globalThis.calls = 0;
globalThis.last = null;
V8Engine.cb((buf) => {
    calls++;
    last = {
        isBuffer: buf instanceof ArrayBuffer,
        length: buf.byteLength,
        bytes: Array.from(new Uint8Array(buf)).join(','),
    };
});
"#;

fn read(ctx: &mut ExecutionContext, expression: &str) -> String {
    ctx.run(expression, "read.js").unwrap().stringify().unwrap()
}

#[test]
fn test_send_without_callback_returns_payload() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run("globalThis.touched = false", "init.js").unwrap();

    let err = ctx.send(vec![1, 2, 3]).unwrap_err();
    assert_eq!(err.status(), SendError::STATUS_NO_CALLBACK);
    assert_eq!(err.into_payload(), Some(vec![1, 2, 3]));
    assert_eq!(read(&mut ctx, "touched"), "false");
}

#[test]
fn test_send_invokes_callback_once_with_bytes() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run(RECORDER, "recorder.js").unwrap();

    ctx.send(vec![1, 2, 255]).unwrap();
    assert_eq!(read(&mut ctx, "calls"), "1");
    assert_eq!(read(&mut ctx, "last.isBuffer"), "true");
    assert_eq!(read(&mut ctx, "last.bytes"), "1,2,255");

    ctx.send(vec![7]).unwrap();
    assert_eq!(read(&mut ctx, "calls"), "2");
    assert_eq!(read(&mut ctx, "last.bytes"), "7");
}

#[test]
fn test_send_zero_length() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run(RECORDER, "recorder.js").unwrap();

    ctx.send(Vec::new()).unwrap();
    assert_eq!(read(&mut ctx, "calls"), "1");
    assert_eq!(read(&mut ctx, "last.length"), "0");
    assert_eq!(read(&mut ctx, "last.bytes"), "");
}

#[test]
fn test_send_payload_with_spare_capacity() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run(RECORDER, "recorder.js").unwrap();

    let mut payload = Vec::with_capacity(1024);
    payload.extend_from_slice(&[3, 1, 4, 1, 5]);
    ctx.send(payload).unwrap();
    assert_eq!(read(&mut ctx, "last.length"), "5");
    assert_eq!(read(&mut ctx, "last.bytes"), "3,1,4,1,5");
}

#[test]
fn test_send_large_payload() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run(
        "V8Engine.cb((buf) => {\n\
             const v = new Uint8Array(buf);\n\
             globalThis.summary = [v.length, v[0], v[v.length - 1]].join();\n\
         })",
        "large.js",
    )
    .unwrap();

    let mut payload = vec![0u8; 1 << 20];
    payload[0] = 9;
    *payload.last_mut().unwrap() = 200;
    ctx.send(payload).unwrap();
    assert_eq!(read(&mut ctx, "summary"), "1048576,9,200");
}

#[test]
fn test_callback_receiver_is_global() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run(
        "V8Engine.cb(function () { globalThis.receiver = this === globalThis; })",
        "receiver.js",
    )
    .unwrap();
    ctx.send(vec![0]).unwrap();
    assert_eq!(read(&mut ctx, "receiver"), "true");
}

#[test]
fn test_last_registration_wins() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run(
        "globalThis.hits = [];\n\
         V8Engine.cb(() => hits.push('first'));\n\
         V8Engine.cb(() => hits.push('second'));",
        "register.js",
    )
    .unwrap();
    ctx.send(vec![1]).unwrap();
    assert_eq!(read(&mut ctx, "hits.join()"), "second");
}

#[test]
fn test_callback_throw_is_reported() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run("V8Engine.cb(() => { throw new Error('bad payload'); })", "throwing.js")
        .unwrap();

    let err = ctx.send(vec![1, 2]).unwrap_err();
    assert_eq!(err.status(), SendError::STATUS_CALLBACK);
    match err {
        SendError::Callback(js) => {
            assert!(js.message.unwrap().contains("bad payload"));
            assert!(js.location.unwrap().starts_with("throwing.js:1:"));
        }
        other => panic!("expected a callback error, got {:?}", other),
    }

    // The context keeps working after a failed send.
    assert_eq!(read(&mut ctx, "'ok'"), "ok");
}

#[test]
fn test_buffer_retained_by_script_survives() {
    let mut ctx = ExecutionContext::new().unwrap();
    ctx.run("globalThis.kept = []; V8Engine.cb((buf) => kept.push(buf));", "keep.js")
        .unwrap();
    for i in 0..10u8 {
        ctx.send(vec![i; 4]).unwrap();
    }
    assert_eq!(
        read(&mut ctx, "kept.map((b) => new Uint8Array(b)[3]).join()"),
        "0,1,2,3,4,5,6,7,8,9"
    );
}
