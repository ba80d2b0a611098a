//! Worker thread implementation for thread-hosted contexts.
//!
//! This module contains the loop that runs in the dedicated thread of each
//! [`crate::ContextHandle`], owning the [`ExecutionContext`] and the values
//! handed out to the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deno_core::v8;
use tokio::sync::{mpsc, watch};

use crate::command::ContextCommand;
use crate::config::ContextOptions;
use crate::context::{ExecutionContext, Value};
use crate::error::RuntimeError;
use crate::value::ValueId;

/// The main worker loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    name: String,
    options: ContextOptions,
    terminated: Arc<AtomicBool>,
    mut cmd_rx: mpsc::Receiver<ContextCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    init_tx: std::sync::mpsc::SyncSender<Result<v8::IsolateHandle, RuntimeError>>,
) {
    let mut context = match ExecutionContext::with_options(options) {
        Ok(context) => context,
        Err(err) => {
            tracing::warn!("[worker:{}] Failed to create context: {}", name, err);
            let _ = init_tx.send(Err(err));
            return;
        }
    };
    tracing::debug!("[worker:{}] Context {} ready", name, context.id());
    let _ = init_tx.send(Ok(context.isolate_handle()));

    let mut values: HashMap<ValueId, Value> = HashMap::new();

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            tracing::debug!("[worker:{}] Shutdown signal received", name);
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("[worker:{}] Received shutdown signal", name);
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("[worker:{}] Command channel closed", name);
                    break;
                };
                handle_command(&name, &mut context, &mut values, cmd);
            }
        }
    }

    // Values go before the context that retains them.
    if !values.is_empty() {
        tracing::debug!("[worker:{}] Releasing {} values", name, values.len());
    }
    values.clear();
    context.dispose();
    tracing::debug!("[worker:{}] Worker finished", name);
}

fn handle_command(
    name: &str,
    context: &mut ExecutionContext,
    values: &mut HashMap<ValueId, Value>,
    cmd: ContextCommand,
) {
    match cmd {
        ContextCommand::Run {
            source,
            origin,
            reply,
        } => match context.run(&source, &origin) {
            Ok(value) => {
                let id = value.id();
                values.insert(id, value);
                if reply.send(Ok(id)).is_err() {
                    tracing::trace!("[worker:{}] Caller went away, releasing value {}", name, id);
                    values.remove(&id);
                }
            }
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
        },

        ContextCommand::LoadModule {
            source,
            name: module,
            mut resolver,
            reply,
        } => {
            let result = context.load_module(&source, &module, resolver.as_mut());
            let _ = reply.send(result.map_err(Into::into));
        }

        ContextCommand::DeclareModule {
            source,
            name: module,
            reply,
        } => {
            let result = context.declare_module(&source, &module);
            let _ = reply.send(result.map_err(Into::into));
        }

        ContextCommand::LinkModule {
            name: module,
            mut resolver,
            reply,
        } => {
            let result = context.link_module(&module, resolver.as_mut());
            let _ = reply.send(result.map_err(Into::into));
        }

        ContextCommand::Send { payload, reply } => {
            let result = context.send(payload);
            let _ = reply.send(result.map_err(Into::into));
        }

        ContextCommand::Stringify { id, reply } => {
            let result = match values.get(&id) {
                Some(value) => value.stringify(),
                None => Err(RuntimeError::ValueDisposed(id.get())),
            };
            let _ = reply.send(result);
        }

        ContextCommand::DisposeValue { id, reply } => {
            if values.remove(&id).is_none() {
                tracing::warn!("[worker:{}] Dispose of unknown value {}", name, id);
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }

        ContextCommand::Info { reply } => {
            let _ = reply.send(Ok(context.info()));
        }
    }
}
