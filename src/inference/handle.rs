//! Exclusive owner of one native context.
//!
//! Every native call on a handle runs under the handle's own lock, so at
//! most one call is in flight per context even when an awaiting caller has
//! given up on it. `close` never waits for an in-flight call: if the
//! context is busy, the last call to leave frees the context on its way out.
//! A call still queued behind the lock when the handle is closed is
//! rejected with [`LlamaError::ClosedHandle`] and never reaches the engine.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::inference::gate::EngineLease;
use crate::inference::llama_ffi::{
    ChatMessage, ContextParams, LlamaBackend, LlamaError, ModelParams, RawHandle, SamplingParams,
};

struct Slot {
    raw: RawHandle,
    /// Keeps the owning gate loaded while this context is alive.
    lease: Option<EngineLease>,
}

pub struct NativeHandle {
    backend: Arc<dyn LlamaBackend>,
    slot: Mutex<Option<Slot>>,
    closed: AtomicBool,
    /// Generate calls that have entered and not yet left.
    in_flight: AtomicUsize,
}

/// Counts one generate call; the last one out after a close frees the context.
struct InFlight<'a>(&'a NativeHandle);

impl<'a> InFlight<'a> {
    fn enter(handle: &'a NativeHandle) -> Self {
        handle.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(handle)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let handle = self.0;
        if handle.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && handle.is_closed() {
            handle.release();
        }
    }
}

impl NativeHandle {
    /// Initialize a native context for `model_path`.
    pub fn open(
        backend: Arc<dyn LlamaBackend>,
        model_path: &Path,
        model: &ModelParams,
        context: &ContextParams,
    ) -> Result<Self, LlamaError> {
        let raw = backend.init(model_path, model, context)?;
        debug!(handle = raw, model = %model_path.display(), "Native context opened");

        Ok(Self {
            backend,
            slot: Mutex::new(Some(Slot { raw, lease: None })),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Tie the context's lifetime to a gate lease.
    pub(crate) fn attach_lease(&self, lease: EngineLease) {
        if let Some(slot) = self.slot.lock().as_mut() {
            slot.lease = Some(lease);
        }
    }

    /// The raw identifier, or `None` once the context has been freed.
    pub fn raw(&self) -> Option<RawHandle> {
        self.slot.lock().as_ref().map(|slot| slot.raw)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forward `messages` to the native engine.
    ///
    /// Blocks for the duration of the native call; async callers should run
    /// it on a blocking thread.
    pub fn generate(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
    ) -> Result<String, LlamaError> {
        let _in_flight = InFlight::enter(self);
        if self.is_closed() {
            return Err(LlamaError::ClosedHandle);
        }

        let slot = self.slot.lock();
        // Closed while this call was queued behind another one.
        if self.is_closed() {
            return Err(LlamaError::ClosedHandle);
        }
        let reply = match slot.as_ref() {
            Some(slot) => self.backend.generate(slot.raw, messages, sampling),
            None => Err(LlamaError::ClosedHandle),
        };
        drop(slot);
        reply
    }

    /// Invalidate the handle and free the native context. Idempotent.
    ///
    /// With a generate call in flight the context is freed when the last
    /// such call returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            self.release();
        }
    }

    fn release(&self) {
        let taken = self.slot.lock().take();
        if let Some(Slot { raw, lease }) = taken {
            if let Err(e) = self.backend.free(raw) {
                warn!(handle = raw, "Failed to free native context: {e}");
            }
            debug!(handle = raw, "Native context freed");
            drop(lease);
        }
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::llama_ffi::StubLlama;

    fn open(stub: &Arc<StubLlama>) -> NativeHandle {
        NativeHandle::open(
            stub.clone(),
            Path::new("test.gguf"),
            &ModelParams::cpu(),
            &ContextParams::default(),
        )
        .unwrap()
    }

    fn prompt() -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", "hello")]
    }

    #[test]
    fn test_generate_forwards_to_backend() {
        let stub = Arc::new(StubLlama::new());
        let handle = open(&stub);

        let reply = handle.generate(&prompt(), &SamplingParams::default()).unwrap();
        assert_eq!(reply.trim(), "You said: hello");
        assert_eq!(stub.calls(handle.raw().unwrap()), Some(1));
    }

    #[test]
    fn test_close_is_idempotent_and_frees_once() {
        let stub = Arc::new(StubLlama::new());
        let handle = open(&stub);
        assert_eq!(stub.live_contexts(), 1);

        handle.close();
        handle.close();

        assert!(handle.is_closed());
        assert_eq!(handle.raw(), None);
        assert_eq!(stub.live_contexts(), 0);
    }

    #[test]
    fn test_generate_after_close_fails() {
        let stub = Arc::new(StubLlama::new());
        let handle = open(&stub);
        handle.close();

        let err = handle.generate(&prompt(), &SamplingParams::default()).unwrap_err();
        assert_eq!(err, LlamaError::ClosedHandle);
    }

    #[test]
    fn test_drop_frees_context() {
        let stub = Arc::new(StubLlama::new());
        drop(open(&stub));
        assert_eq!(stub.live_contexts(), 0);
    }
}
