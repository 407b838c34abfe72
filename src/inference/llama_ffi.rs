//! FFI boundary to the llama.cpp text-generation library.
//!
//! [`LlamaBackend`] is the capability the rest of the crate consumes:
//! `init` a context for a model, `generate` a reply for a chat history,
//! `free` the context. The native library is linked by the host
//! application; [`StubLlama`] simulates its handle table so the binary and
//! the tests run without the C library.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlamaError {
    #[error("Failed to initialize native engine: {0}")]
    InitFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Context size exceeded: {required} tokens required, {available} available")]
    ContextExceeded { required: usize, available: usize },

    #[error("Invalid handle: {0}")]
    InvalidHandle(RawHandle),

    #[error("Native handle has been closed")]
    ClosedHandle,
}

/// Opaque identifier of a native context.
pub type RawHandle = i64;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelParams {
    /// Number of GPU layers to offload; -1 offloads all of them.
    pub n_gpu_layers: i32,
}

impl ModelParams {
    /// Keep every layer on the host.
    pub fn cpu() -> Self {
        Self { n_gpu_layers: 0 }
    }

    /// Offload every layer to the GPU.
    pub fn gpu() -> Self {
        Self { n_gpu_layers: -1 }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 4096,
        }
    }
}

/// Sampler chain settings passed with every generate call.
///
/// A `seed` of 0 selects greedy sampling; any other value seeds the
/// distribution sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub top_k: i32,
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.98,
            top_p: 0.37,
            repetition_penalty: 1.18,
            top_k: 100,
            seed: 0,
        }
    }
}

/// One role/content pair as handed to the chat template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// The native inference capability.
///
/// Implementations are not required to tolerate concurrent calls on the
/// same handle; callers serialize access per handle.
pub trait LlamaBackend: Send + Sync {
    /// Load a model and create a context for it.
    fn init(
        &self,
        model_path: &Path,
        model: &ModelParams,
        context: &ContextParams,
    ) -> Result<RawHandle, LlamaError>;

    /// Produce the assistant continuation for `messages`.
    fn generate(
        &self,
        handle: RawHandle,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
    ) -> Result<String, LlamaError>;

    /// Release the context behind `handle`.
    fn free(&self, handle: RawHandle) -> Result<(), LlamaError>;
}

/// Render messages with a ChatML template, ending with an open assistant turn.
pub fn apply_chat_template(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(&message.role);
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// Approximate token count (about one token per 4 bytes).
pub fn count_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

struct StubContext {
    model_path: PathBuf,
    n_gpu_layers: i32,
    n_ctx: u32,
    calls: u64,
}

/// Stub backend.
///
/// In a real build this would be backed by `llama_init_from_model`,
/// `llama_decode` and the sampler chain. The stub keeps the same handle
/// table semantics (unknown handles are rejected, freeing twice fails) and
/// answers by echoing the latest user turn.
pub struct StubLlama {
    contexts: Mutex<HashMap<RawHandle, StubContext>>,
    next_handle: AtomicI64,
}

impl StubLlama {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            next_handle: AtomicI64::new(1),
        }
    }

    /// Number of live contexts.
    pub fn live_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    /// GPU layers `handle` was initialized with.
    pub fn gpu_layers(&self, handle: RawHandle) -> Option<i32> {
        self.contexts.lock().get(&handle).map(|ctx| ctx.n_gpu_layers)
    }

    /// Number of generate calls served by `handle`.
    pub fn calls(&self, handle: RawHandle) -> Option<u64> {
        self.contexts.lock().get(&handle).map(|ctx| ctx.calls)
    }

    fn reply(messages: &[ChatMessage]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.trim())
            .unwrap_or_default();

        if last_user.is_empty() {
            return String::new();
        }

        // Leading/trailing whitespace like a detokenized stream.
        format!(" You said: {last_user}\n")
    }
}

impl Default for StubLlama {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaBackend for StubLlama {
    fn init(
        &self,
        model_path: &Path,
        model: &ModelParams,
        context: &ContextParams,
    ) -> Result<RawHandle, LlamaError> {
        if model_path.as_os_str().is_empty() {
            return Err(LlamaError::InitFailed(
                "Model path should not be empty".to_string(),
            ));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().insert(
            handle,
            StubContext {
                model_path: model_path.to_path_buf(),
                n_gpu_layers: model.n_gpu_layers,
                n_ctx: context.n_ctx,
                calls: 0,
            },
        );

        tracing::debug!(
            handle,
            model = %model_path.display(),
            n_gpu_layers = model.n_gpu_layers,
            n_ctx = context.n_ctx,
            "Stub context created"
        );

        Ok(handle)
    }

    fn generate(
        &self,
        handle: RawHandle,
        messages: &[ChatMessage],
        _sampling: &SamplingParams,
    ) -> Result<String, LlamaError> {
        let mut contexts = self.contexts.lock();
        let ctx = contexts
            .get_mut(&handle)
            .ok_or(LlamaError::InvalidHandle(handle))?;

        let prompt = apply_chat_template(messages);
        let reply = Self::reply(messages);
        let required = count_tokens(&prompt) + count_tokens(&reply);
        let available = ctx.n_ctx as usize;
        if required > available {
            return Err(LlamaError::ContextExceeded {
                required,
                available,
            });
        }

        ctx.calls += 1;

        if reply.trim().is_empty() {
            return Err(LlamaError::GenerationFailed(
                "Unable to generate response".to_string(),
            ));
        }

        tracing::trace!(handle, model = %ctx.model_path.display(), required, "Stub generation");

        Ok(reply)
    }

    fn free(&self, handle: RawHandle) -> Result<(), LlamaError> {
        self.contexts
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(LlamaError::InvalidHandle(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(prompt: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::new("system", ""),
            ChatMessage::new("user", prompt),
        ]
    }

    #[test]
    fn test_default_sampling() {
        let sampling = SamplingParams::default();
        assert_eq!(sampling.temperature, 0.98);
        assert_eq!(sampling.top_p, 0.37);
        assert_eq!(sampling.repetition_penalty, 1.18);
        assert_eq!(sampling.top_k, 100);
        assert_eq!(sampling.seed, 0);
    }

    #[test]
    fn test_chat_template_ends_with_assistant_turn() {
        let prompt = apply_chat_template(&conversation("hi"));
        assert!(prompt.starts_with("<|im_start|>system\n<|im_end|>\n"));
        assert!(prompt.contains("<|im_start|>user\nhi<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_stub_handle_lifecycle() {
        let llama = StubLlama::new();
        let handle = llama
            .init(Path::new("test.gguf"), &ModelParams::cpu(), &ContextParams::default())
            .unwrap();
        assert_eq!(llama.live_contexts(), 1);

        let reply = llama
            .generate(handle, &conversation("What is Rust?"), &SamplingParams::default())
            .unwrap();
        assert_eq!(reply.trim(), "You said: What is Rust?");
        assert_eq!(llama.calls(handle), Some(1));

        llama.free(handle).unwrap();
        assert_eq!(llama.live_contexts(), 0);
        assert_eq!(llama.free(handle), Err(LlamaError::InvalidHandle(handle)));
    }

    #[test]
    fn test_stub_rejects_empty_model_path() {
        let llama = StubLlama::new();
        let err = llama
            .init(Path::new(""), &ModelParams::cpu(), &ContextParams::default())
            .unwrap_err();
        assert!(matches!(err, LlamaError::InitFailed(_)));
    }

    #[test]
    fn test_stub_context_exceeded() {
        let llama = StubLlama::new();
        let params = ContextParams { n_ctx: 8, n_batch: 8 };
        let handle = llama
            .init(Path::new("test.gguf"), &ModelParams::cpu(), &params)
            .unwrap();

        let long_prompt = "word ".repeat(64);
        let err = llama
            .generate(handle, &conversation(&long_prompt), &SamplingParams::default())
            .unwrap_err();
        assert!(matches!(err, LlamaError::ContextExceeded { available: 8, .. }));
    }

    #[test]
    fn test_stub_empty_reply_is_an_error() {
        let llama = StubLlama::new();
        let handle = llama
            .init(Path::new("test.gguf"), &ModelParams::cpu(), &ContextParams::default())
            .unwrap();

        let err = llama
            .generate(handle, &conversation("   "), &SamplingParams::default())
            .unwrap_err();
        assert_eq!(
            err,
            LlamaError::GenerationFailed("Unable to generate response".to_string())
        );
    }
}
