//! llama-session: conversation sessions over a llama.cpp text-generation handle.
//!
//! A [`LoadGate`] loads one native binary set (CPU or CUDA) and creates
//! [`TextGeneration`] sessions on top of it. Each session owns one native
//! context, keeps the ordered conversation history and serializes
//! `generate` calls so the context never sees two native calls at once.

pub mod config;
pub mod inference;
pub mod session;

pub use inference::gate::{CreateOptions, GateError, LoadGate, LoadState};
pub use inference::llama_ffi::{ContextParams, LlamaBackend, LlamaError, SamplingParams};
pub use inference::loader::{Backend, NativeBinaries, NativeLoader};
pub use session::generation::{FailurePolicy, SessionError, SessionState, TextGeneration};
pub use session::message::{Exchange, Message, Role};
pub use session::task::GenerationTask;
