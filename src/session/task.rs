//! In-flight generation as a cancellable unit of work.
//!
//! Dropping a [`GenerationTask`] detaches it; the generation keeps running
//! and its exchange is still recorded in the session.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::generation::{SessionError, TextGeneration};
use crate::session::message::Exchange;

pub struct GenerationTask {
    token: CancellationToken,
    join: JoinHandle<Result<Exchange, SessionError>>,
}

impl GenerationTask {
    /// Spawn `session.generate(prompt)` on the current tokio runtime.
    pub fn spawn(session: Arc<TextGeneration>, prompt: impl Into<String>) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let prompt = prompt.into();

        let join =
            tokio::spawn(async move { session.generate_cancellable(&prompt, &child).await });

        Self { token, join }
    }

    /// Request cancellation. Returns immediately.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token that cancels this task; cloning it is cheap.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the outcome.
    pub async fn join(self) -> Result<Exchange, SessionError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SessionError::Cancelled),
            Err(e) => Err(SessionError::Task(e.to_string())),
        }
    }

    /// Cancel and wait until the session lock has been released.
    pub async fn cancel_and_join(self) -> Result<Exchange, SessionError> {
        self.cancel();
        self.join().await
    }
}
