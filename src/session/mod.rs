//! Conversation sessions.
//!
//! - [`message`]: roles, messages and exchanges
//! - [`history`]: ordered history with a fixed base message
//! - [`generation`]: the session itself (generate / history / reset / close)
//! - [`task`]: spawned, cancellable generate calls

pub mod generation;
pub mod history;
pub mod message;
pub mod task;
