//! Handles to thread-hosted contexts.
//!
//! [`ContextHandle`] and [`ValueHandle`] are `Send + Sync`. Every operation
//! becomes a command for the context's worker thread and waits for the reply,
//! so calls from several threads run one after another.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use deno_core::v8;
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::{ContextCommand, Reply};
use crate::context::ContextInfo;
use crate::error::RuntimeError;
use crate::module::ModuleResolver;
use crate::value::ValueId;

/// Send a command and wait for its reply.
async fn send_command<T>(
    cmd_tx: &mpsc::Sender<ContextCommand>,
    terminated: &AtomicBool,
    make_cmd: impl FnOnce(Reply<T>) -> ContextCommand,
) -> Result<T, RuntimeError> {
    if terminated.load(Ordering::SeqCst) {
        return Err(RuntimeError::ContextDisposed);
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx
        .send(make_cmd(reply_tx))
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;

    reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
}

/// Handle to a context running on its own thread.
///
/// Created by [`crate::spawn_context`]. Dropping the handle disposes the
/// context and joins its thread.
pub struct ContextHandle {
    pub(crate) name: String,
    pub(crate) cmd_tx: mpsc::Sender<ContextCommand>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    /// Set once the context is being disposed
    pub(crate) terminated: Arc<AtomicBool>,
    /// V8 isolate handle for forced termination
    pub(crate) isolate_handle: v8::IsolateHandle,
    pub(crate) thread_handle: Mutex<Option<thread::JoinHandle<Result<(), RuntimeError>>>>,
}

impl ContextHandle {
    async fn send_command<T>(
        &self,
        make_cmd: impl FnOnce(Reply<T>) -> ContextCommand,
    ) -> Result<T, RuntimeError> {
        send_command(&self.cmd_tx, &self.terminated, make_cmd).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a classic script named `origin` and keep its result.
    pub async fn run(
        &self,
        source: impl Into<String>,
        origin: impl Into<String>,
    ) -> Result<ValueHandle, RuntimeError> {
        let source = source.into();
        let origin = origin.into();
        let id = self
            .send_command(|reply| ContextCommand::Run {
                source,
                origin,
                reply,
            })
            .await?;
        Ok(ValueHandle {
            id,
            cmd_tx: self.cmd_tx.clone(),
            terminated: self.terminated.clone(),
            released: false,
        })
    }

    /// Load a module. `resolver` runs on the context thread.
    pub async fn load_module(
        &self,
        source: impl Into<String>,
        name: impl Into<String>,
        resolver: impl ModuleResolver + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let source = source.into();
        let name = name.into();
        self.send_command(|reply| ContextCommand::LoadModule {
            source,
            name,
            resolver: Box::new(resolver),
            reply,
        })
        .await
    }

    /// Compile and register a module without linking it.
    pub async fn declare_module(
        &self,
        source: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let source = source.into();
        let name = name.into();
        self.send_command(|reply| ContextCommand::DeclareModule {
            source,
            name,
            reply,
        })
        .await
    }

    /// Link and evaluate a declared module.
    pub async fn link_module(
        &self,
        name: impl Into<String>,
        resolver: impl ModuleResolver + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        self.send_command(|reply| ContextCommand::LinkModule {
            name,
            resolver: Box::new(resolver),
            reply,
        })
        .await
    }

    /// Hand `payload` to the script's registered callback.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), RuntimeError> {
        self.send_command(|reply| ContextCommand::Send { payload, reply })
            .await
    }

    pub async fn info(&self) -> Result<ContextInfo, RuntimeError> {
        self.send_command(|reply| ContextCommand::Info { reply })
            .await
    }

    /// Stop the script currently running on the context thread.
    ///
    /// The interrupted operation fails with the termination error and the
    /// context stays usable. If nothing is running, the next script is
    /// stopped as soon as it starts.
    pub fn terminate_execution(&self) {
        tracing::debug!("[handle:{}] Terminating execution", self.name);
        self.isolate_handle.terminate_execution();
    }

    /// Whether the context has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Dispose the context and wait for its thread to finish.
    pub fn dispose(self) -> Result<(), RuntimeError> {
        self.shutdown();
        self.join_thread()
    }

    fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the worker's select! and stop any script that is stuck
        let _ = self.shutdown_tx.send(true);
        self.isolate_handle.terminate_execution();
    }

    fn join_thread(&self) -> Result<(), RuntimeError> {
        let handle = self
            .thread_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.join_thread();
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// A value kept alive on a context thread.
///
/// Dropping the handle queues its release without blocking.
pub struct ValueHandle {
    id: ValueId,
    cmd_tx: mpsc::Sender<ContextCommand>,
    terminated: Arc<AtomicBool>,
    released: bool,
}

impl ValueHandle {
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// The value's JavaScript string conversion.
    pub async fn stringify(&self) -> Result<String, RuntimeError> {
        let id = self.id;
        send_command(&self.cmd_tx, &self.terminated, |reply| {
            ContextCommand::Stringify { id, reply }
        })
        .await
    }

    /// Release the value and wait until the context has dropped it.
    pub async fn dispose(mut self) -> Result<(), RuntimeError> {
        self.released = true;
        let id = self.id;
        send_command(&self.cmd_tx, &self.terminated, |reply| {
            ContextCommand::DisposeValue {
                id,
                reply: Some(reply),
            }
        })
        .await
    }
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        if self.released || self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let cmd = ContextCommand::DisposeValue {
            id: self.id,
            reply: None,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.cmd_tx.try_send(cmd) {
            tracing::warn!(
                "[handle] Command queue full, value {} is kept until its context is disposed",
                self.id
            );
        }
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle").field("id", &self.id).finish()
    }
}
