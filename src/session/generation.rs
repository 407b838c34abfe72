//! Text-generation session over one native handle.
//!
//! A single async lock covers the history and the sampling settings;
//! `generate`, `history` and `reset` all take it, so exchanges are applied
//! in lock-acquisition order. The native call itself runs on a blocking
//! thread and is serialized again by the handle, which keeps at most one
//! native call in flight even after a cancelled caller has released the
//! session lock.
//!
//! Cancellation is cooperative. It takes effect at the next suspension
//! point (waiting for the lock or for the native result), never in the
//! middle of a native call: a call that is already running completes and
//! its reply is discarded.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::inference::handle::NativeHandle;
use crate::inference::llama_ffi::{LlamaError, SamplingParams};
use crate::session::history::ConversationHistory;
use crate::session::message::{Exchange, Message};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Engine error: {0}")]
    Engine(#[from] LlamaError),

    #[error("Session has been closed")]
    Closed,

    #[error("Generation was cancelled")]
    Cancelled,

    #[error("Generation task failed: {0}")]
    Task(String),
}

/// What happens to the user turn when a generate call fails or is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// The user message stays in history.
    #[default]
    Keep,
    /// The user message is removed again.
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating,
    Closed,
}

const IDLE: u8 = 0;
const GENERATING: u8 = 1;
const CLOSED: u8 = 2;

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            GENERATING => SessionState::Generating,
            CLOSED => SessionState::Closed,
            _ => SessionState::Idle,
        }
    }
}

/// Marks the session as generating; flips back to idle on drop unless closed.
struct Generating<'a>(&'a AtomicU8);

impl<'a> Generating<'a> {
    fn enter(state: &'a AtomicU8) -> Result<Self, SessionError> {
        match state.compare_exchange(IDLE, GENERATING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(Self(state)),
            Err(CLOSED) => Err(SessionError::Closed),
            // Left over from a caller that was dropped mid-generation.
            Err(_) => Ok(Self(state)),
        }
    }
}

impl Drop for Generating<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .compare_exchange(GENERATING, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }
}

struct Inner {
    history: ConversationHistory,
    sampling: SamplingParams,
}

/// A user turn awaiting its reply, holding the session lock.
///
/// Dropped without a committed reply, it applies the failure policy.
struct PendingTurn<'a> {
    inner: MutexGuard<'a, Inner>,
    input: Uuid,
    rollback: bool,
}

impl PendingTurn<'_> {
    fn commit(mut self, output: Message) {
        self.rollback = false;
        self.inner.history.push(output);
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.rollback && self.inner.history.pop_if_last(self.input).is_some() {
            debug!("User turn rolled back");
        }
    }
}

pub struct TextGeneration {
    handle: Arc<NativeHandle>,
    inner: Mutex<Inner>,
    state: AtomicU8,
    failure_policy: FailurePolicy,
}

impl std::fmt::Debug for TextGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextGeneration")
            .field("state", &self.state())
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl TextGeneration {
    /// Start a session on `handle` with `system_prompt` as the base message.
    pub fn new(handle: NativeHandle, system_prompt: &str) -> Self {
        Self {
            handle: Arc::new(handle),
            inner: Mutex::new(Inner {
                history: ConversationHistory::new(system_prompt),
                sampling: SamplingParams::default(),
            }),
            state: AtomicU8::new(IDLE),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.inner.get_mut().sampling = sampling;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Current state, read without taking the session lock.
    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Snapshot of the conversation, base message first.
    pub async fn history(&self) -> Result<Vec<Message>, SessionError> {
        self.ensure_open()?;
        let inner = self.inner.lock().await;
        self.ensure_open()?;
        Ok(inner.history.snapshot())
    }

    /// Drop every turn except the base message.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;
        self.ensure_open()?;
        inner.history.reset();
        debug!("Session history reset");
        Ok(())
    }

    pub async fn sampling(&self) -> Result<SamplingParams, SessionError> {
        self.ensure_open()?;
        Ok(self.inner.lock().await.sampling.clone())
    }

    /// Replace the sampling settings used by subsequent generate calls.
    pub async fn set_sampling(&self, sampling: SamplingParams) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.inner.lock().await.sampling = sampling;
        Ok(())
    }

    /// Send `prompt` and wait for the reply.
    pub async fn generate(&self, prompt: &str) -> Result<Exchange, SessionError> {
        self.generate_cancellable(prompt, &CancellationToken::new())
            .await
    }

    /// Like [`generate`](Self::generate), giving up once `cancel` fires.
    ///
    /// A cancelled call returns [`SessionError::Cancelled`] and never
    /// appends an assistant message. Dropping the future before it resolves
    /// has the same effect on history.
    pub async fn generate_cancellable(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Exchange, SessionError> {
        self.ensure_open()?;

        let mut inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            guard = self.inner.lock() => guard,
        };

        let _generating = Generating::enter(&self.state)?;

        let input = Message::user(prompt.trim());
        inner.history.push(input.clone());

        let payload = inner.history.to_chat();
        let sampling = inner.sampling.clone();
        let handle = self.handle.clone();

        let turn = PendingTurn {
            inner,
            input: input.id(),
            rollback: self.failure_policy == FailurePolicy::Rollback,
        };

        debug!(turns = payload.len(), "Generation started");

        let call = tokio::task::spawn_blocking(move || handle.generate(&payload, &sampling));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            joined = call => match joined {
                Ok(result) => result.map_err(SessionError::from),
                Err(e) => Err(SessionError::Task(e.to_string())),
            },
        };

        // Closed while the native call was running.
        let outcome = if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            outcome
        };

        match outcome {
            Ok(text) => {
                let output = Message::assistant(text.trim());
                debug!(chars = output.content().len(), "Generation finished");
                turn.commit(output.clone());
                Ok(Exchange { input, output })
            }
            Err(e) => {
                debug!("Generation ended without a reply: {e}");
                Err(e)
            }
        }
    }

    /// Close the session and release the native handle. Idempotent.
    ///
    /// Does not wait for an in-flight native call; the handle is freed as
    /// soon as that call returns.
    pub fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        self.handle.close();
        debug!("Session closed");
    }
}

impl Drop for TextGeneration {
    fn drop(&mut self) {
        self.close();
    }
}
