//! Value handles.
//!
//! Values produced by a context live in that context's [`ValueArena`] as
//! strong `v8::Global` references. The host only ever sees a [`ValueId`];
//! the V8 pointer never leaves the arena.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use deno_core::v8;
use serde::{Deserialize, Serialize};

static LIVE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);
static LIVE_VALUES: AtomicUsize = AtomicUsize::new(0);
static LIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);

/// Process-wide count of live contexts, retained values and send buffers
/// that V8 has not freed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleStats {
    pub contexts: usize,
    pub values: usize,
    pub buffers: usize,
}

/// Snapshot of the live handle counts.
pub fn stats() -> HandleStats {
    HandleStats {
        contexts: LIVE_CONTEXTS.load(Ordering::SeqCst),
        values: LIVE_VALUES.load(Ordering::SeqCst),
        buffers: LIVE_BUFFERS.load(Ordering::SeqCst),
    }
}

pub(crate) fn context_created() {
    LIVE_CONTEXTS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn context_dropped() {
    LIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
}

/// Payload handed to V8 as the backing store of a send buffer.
///
/// V8 owns it from then on and drops it, exactly once, when the collector
/// frees the `ArrayBuffer` or the isolate goes away.
pub(crate) struct TrackedBuffer(Vec<u8>);

impl TrackedBuffer {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        LIVE_BUFFERS.fetch_add(1, Ordering::SeqCst);
        Self(bytes)
    }
}

impl AsRef<[u8]> for TrackedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for TrackedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        LIVE_BUFFERS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stable identifier of a value handle within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(u64);

impl ValueId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retained values of one context, keyed by [`ValueId`].
#[derive(Default)]
pub(crate) struct ValueArena {
    next_id: u64,
    values: HashMap<ValueId, v8::Global<v8::Value>>,
}

impl ValueArena {
    pub(crate) fn insert(&mut self, value: v8::Global<v8::Value>) -> ValueId {
        self.next_id += 1;
        let id = ValueId(self.next_id);
        self.values.insert(id, value);
        LIVE_VALUES.fetch_add(1, Ordering::SeqCst);
        id
    }

    pub(crate) fn get(&self, id: ValueId) -> Option<&v8::Global<v8::Value>> {
        self.values.get(&id)
    }

    /// Release the retained reference. Returns false if `id` was unknown.
    pub(crate) fn release(&mut self, id: ValueId) -> bool {
        let released = self.values.remove(&id).is_some();
        if released {
            LIVE_VALUES.fetch_sub(1, Ordering::SeqCst);
        }
        released
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }
}

impl Drop for ValueArena {
    fn drop(&mut self) {
        LIVE_VALUES.fetch_sub(self.values.len(), Ordering::SeqCst);
    }
}
