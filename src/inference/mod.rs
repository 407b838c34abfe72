//! Native inference boundary.
//!
//! - [`llama_ffi`]: the llama.cpp capability and its stub
//! - [`handle`]: exclusive owner of one native context
//! - [`loader`]: native binary sets and the component loader
//! - [`gate`]: one-shot load gate and engine creation

pub mod gate;
pub mod handle;
pub mod llama_ffi;
pub mod loader;
