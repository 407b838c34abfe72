//! Runtime configuration for llama-session.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Command-line flags override the file.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::inference::gate::CreateOptions;
use crate::inference::llama_ffi::{ContextParams, SamplingParams};
use crate::inference::loader::{Backend, NativeBinaries};
use crate::session::generation::FailurePolicy;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llama-session", about = "Terminal chat over a llama.cpp model")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// GGUF model file (overrides the config file).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Directory holding the native binaries (overrides the config file).
    #[arg(long)]
    pub native_dir: Option<PathBuf>,

    /// Load the CUDA binary set instead of the CPU one.
    #[arg(long)]
    pub cuda: bool,

    /// System prompt (overrides the config file).
    #[arg(short, long)]
    pub system_prompt: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Native binaries.
    pub native: NativeConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Sampler settings.
    pub sampling: SamplingParams,

    /// Session behavior.
    pub session: SessionConfig,
}

/// Which native binary set to load, and from where.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub backend: Backend,

    /// Directory containing ggml/llama/text-generation binaries.
    pub dir: PathBuf,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Cpu,
            dir: PathBuf::from("bin"),
        }
    }
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Base message of every conversation.
    pub system_prompt: String,

    /// Context size in tokens.
    pub context_size: u32,

    /// Batch size for prompt processing.
    pub batch_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let context = ContextParams::default();
        Self {
            model_path: PathBuf::from("model.gguf"),
            system_prompt: String::new(),
            context_size: context.n_ctx,
            batch_size: context.n_batch,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether a failed or cancelled generate keeps the user message.
    pub failure_policy: FailurePolicy,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(model) = &cli.model {
            self.model.model_path = model.clone();
        }
        if let Some(dir) = &cli.native_dir {
            self.native.dir = dir.clone();
        }
        if cli.cuda {
            self.native.backend = Backend::Cuda;
        }
        if let Some(prompt) = &cli.system_prompt {
            self.model.system_prompt = prompt.clone();
        }
    }

    pub fn binaries(&self) -> NativeBinaries {
        NativeBinaries::in_dir(&self.native.dir, self.native.backend)
    }

    pub fn create_options(&self) -> CreateOptions {
        CreateOptions::new(&self.model.model_path)
            .system_prompt(&self.model.system_prompt)
            .context_size(self.model.context_size)
            .batch_size(self.model.batch_size)
            .sampling(self.sampling.clone())
            .failure_policy(self.session.failure_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.model.context_size, 2048);
        assert_eq!(cfg.model.batch_size, 4096);
        assert_eq!(cfg.native.backend, Backend::Cpu);
        assert_eq!(cfg.session.failure_policy, FailurePolicy::Keep);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "native": { "backend": "cuda" },
                "sampling": { "seed": 7 },
                "session": { "failure_policy": "rollback" }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.native.backend, Backend::Cuda);
        assert_eq!(cfg.native.dir, PathBuf::from("bin"));
        assert_eq!(cfg.sampling.seed, 7);
        assert_eq!(cfg.sampling.top_k, 100);
        assert_eq!(cfg.session.failure_policy, FailurePolicy::Rollback);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "llama-session",
            "--model",
            "tiny.gguf",
            "--cuda",
            "--system-prompt",
            "be brief",
        ]);
        let mut cfg = Config::default();
        cfg.apply_cli(&cli);

        assert_eq!(cfg.model.model_path, PathBuf::from("tiny.gguf"));
        assert_eq!(cfg.binaries().backend(), Backend::Cuda);

        let options = cfg.create_options();
        assert_eq!(options.system_prompt, "be brief");
        assert_eq!(options.context.n_ctx, 2048);
    }
}
