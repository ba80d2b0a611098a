//! Spawning thread-hosted contexts.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use deno_core::v8;
use tokio::sync::{mpsc, watch};

use crate::config::ContextOptions;
use crate::error::RuntimeError;
use crate::handle::ContextHandle;
use crate::platform::init_platform;
use crate::worker::run_worker;

/// Start a context on its own OS thread and wait until its isolate exists.
///
/// The thread is named `name` and runs a current-thread tokio runtime that
/// serves the returned handle's commands one at a time.
pub fn spawn_context(
    name: impl Into<String>,
    options: ContextOptions,
) -> Result<ContextHandle, RuntimeError> {
    let name = name.into();
    options.validate()?;
    tracing::debug!("[spawn_context] Starting {}", name);
    init_platform();

    let terminated = Arc::new(AtomicBool::new(false));
    let terminated_clone = terminated.clone();

    // Command channel
    let (cmd_tx, cmd_rx) = mpsc::channel(options.command_buffer);

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Channel to receive the isolate handle from the worker thread
    let (init_tx, init_rx) =
        std::sync::mpsc::sync_channel::<Result<v8::IsolateHandle, RuntimeError>>(1);

    let name_clone = name.clone();
    let thread_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), RuntimeError> {
            tracing::debug!("[spawn_context:{}] Thread started", name_clone);

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::SpawnFailed)?;

            rt.block_on(run_worker(
                name_clone.clone(),
                options,
                terminated_clone,
                cmd_rx,
                shutdown_rx,
                init_tx,
            ));

            rt.shutdown_background();
            tracing::debug!("[spawn_context:{}] Thread exiting", name_clone);
            Ok(())
        })?;

    // Wait for initialization
    let isolate_handle = match init_rx.recv() {
        Ok(result) => result?,
        Err(_) => {
            // The thread ended before reporting; surface its own error.
            return match thread_handle.join() {
                Ok(Err(err)) => Err(err),
                Ok(Ok(())) => Err(RuntimeError::ChannelClosed),
                Err(_) => Err(RuntimeError::ThreadPanic),
            };
        }
    };

    tracing::debug!("[spawn_context] {} is ready", name);

    Ok(ContextHandle {
        name,
        cmd_tx,
        shutdown_tx,
        terminated,
        isolate_handle,
        thread_handle: Mutex::new(Some(thread_handle)),
    })
}
