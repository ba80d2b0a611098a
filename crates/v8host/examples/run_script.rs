//! Run a script file on a thread-hosted context.
//!
//! Run with: cargo run -p v8host --example run_script -- path/to/script.js [config.toml]
//!
//! The script may register a callback with `V8Engine.cb(fn)`; it then
//! receives the script's own path as a byte buffer.

use std::path::PathBuf;

use anyhow::Context as _;
use v8host::{spawn_context, ContextOptions, RuntimeError, SendError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let script = PathBuf::from(args.next().context("usage: run_script <script.js> [config.toml]")?);
    let config = args.next().map(PathBuf::from);

    let options = ContextOptions::load(config.as_deref())?;
    let source = std::fs::read_to_string(&script)
        .with_context(|| format!("failed to read {}", script.display()))?;
    let origin = script.display().to_string();

    tracing::info!("V8 {}", v8host::version());
    let handle = spawn_context("run-script", options)?;

    match handle.run(source, origin.clone()).await {
        Ok(value) => println!("=> {}", value.stringify().await?),
        Err(RuntimeError::JavaScript(err)) => {
            eprintln!("Uncaught {:#}", err);
            if let Some(location) = &err.location {
                eprintln!("    at {}", location);
            }
        }
        Err(err) => return Err(err.into()),
    }

    match handle.send(origin.into_bytes()).await {
        Ok(()) => tracing::info!("Callback received the script path"),
        Err(RuntimeError::Send(SendError::NoCallback(_))) => {
            tracing::info!("No callback registered");
        }
        Err(err) => return Err(err.into()),
    }

    println!("{}", serde_json::to_string_pretty(&handle.info().await?)?);
    handle.dispose()?;
    Ok(())
}
