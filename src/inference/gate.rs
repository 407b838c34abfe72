//! One-shot load gate for a set of native binaries.
//!
//! A gate moves from `Unloaded` to `Loaded(Cpu)` or `Loaded(Cuda)` exactly
//! once per load, and engines can only be created while it is loaded. The
//! gate is an explicit object rather than a process global: every engine
//! created through it holds a lease, and closing the last live engine
//! unloads the gate.
//!
//! The state marker is an atomic readable from any thread without locking.
//! Transitions and engine registration go through the registry lock.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::inference::handle::NativeHandle;
use crate::inference::llama_ffi::{
    ContextParams, LlamaBackend, LlamaError, ModelParams, SamplingParams,
};
use crate::inference::loader::{
    Backend, CpuBinaries, CudaBinaries, LoaderError, NativeBinaries, NativeComponent, NativeLoader,
};
use crate::session::generation::{FailurePolicy, TextGeneration};

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Native binaries were not loaded")]
    NotLoaded,

    #[error("Native binaries have already been loaded as {0}")]
    AlreadyLoaded(LoadState),

    #[error("Failed to load native component {component}: {source}")]
    LoadFailure {
        component: NativeComponent,
        #[source]
        source: LoaderError,
    },

    #[error("Cannot unload while {0} engine(s) are alive")]
    EnginesAlive(usize),

    #[error("Invalid engine options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Engine(#[from] LlamaError),
}

/// Whether, and how, the native binaries are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Unloaded,
    Loaded(Backend),
}

impl LoadState {
    fn to_raw(self) -> u8 {
        match self {
            LoadState::Unloaded => 0,
            LoadState::Loaded(Backend::Cpu) => 1,
            LoadState::Loaded(Backend::Cuda) => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => LoadState::Loaded(Backend::Cpu),
            2 => LoadState::Loaded(Backend::Cuda),
            _ => LoadState::Unloaded,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Unloaded => write!(f, "Unloaded"),
            LoadState::Loaded(backend) => write!(f, "{backend}"),
        }
    }
}

/// Parameters for [`LoadGate::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub model_path: PathBuf,
    pub system_prompt: String,
    pub context: ContextParams,
    pub sampling: SamplingParams,
    pub failure_policy: FailurePolicy,
}

impl CreateOptions {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            system_prompt: String::new(),
            context: ContextParams::default(),
            sampling: SamplingParams::default(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn context_size(mut self, n_ctx: u32) -> Self {
        self.context.n_ctx = n_ctx;
        self
    }

    pub fn batch_size(mut self, n_batch: u32) -> Self {
        self.context.n_batch = n_batch;
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    fn validate(&self) -> Result<(), GateError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(GateError::InvalidOptions(
                "model path should not be empty".to_string(),
            ));
        }
        if self.context.n_ctx == 0 || self.context.n_batch == 0 {
            return Err(GateError::InvalidOptions(format!(
                "context size ({}) and batch size ({}) must be positive",
                self.context.n_ctx, self.context.n_batch
            )));
        }
        Ok(())
    }
}

struct Registry {
    /// Components loaded by the last successful load, in load order.
    loaded: Vec<(NativeComponent, PathBuf)>,
    live_engines: usize,
}

struct GateShared {
    loader: Arc<dyn NativeLoader>,
    backend: Arc<dyn LlamaBackend>,
    state: AtomicU8,
    registry: Mutex<Registry>,
}

impl GateShared {
    fn state(&self) -> LoadState {
        LoadState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LoadState) {
        self.state.store(state.to_raw(), Ordering::Release);
    }

    /// Unload `components` in reverse order, best effort.
    fn unload_all(&self, components: Vec<(NativeComponent, PathBuf)>) {
        for (component, path) in components.into_iter().rev() {
            if let Err(e) = self.loader.unload(component, &path) {
                warn!(component = %component, "Failed to unload native component: {e}");
            }
        }
    }

    fn release_engine(&self) {
        let mut registry = self.registry.lock();
        registry.live_engines = registry.live_engines.saturating_sub(1);
        if registry.live_engines == 0 && self.state() != LoadState::Unloaded {
            let loaded = std::mem::take(&mut registry.loaded);
            self.unload_all(loaded);
            self.set_state(LoadState::Unloaded);
            info!("Last engine closed, native binaries unloaded");
        }
    }
}

/// Held by every engine created through a gate; dropping it releases the engine.
pub(crate) struct EngineLease {
    shared: Arc<GateShared>,
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.shared.release_engine();
    }
}

/// Guards loading of one native binary set and creation of engines on top of it.
#[derive(Clone)]
pub struct LoadGate {
    shared: Arc<GateShared>,
}

impl LoadGate {
    pub fn new(loader: Arc<dyn NativeLoader>, backend: Arc<dyn LlamaBackend>) -> Self {
        Self {
            shared: Arc::new(GateShared {
                loader,
                backend,
                state: AtomicU8::new(LoadState::Unloaded.to_raw()),
                registry: Mutex::new(Registry {
                    loaded: Vec::new(),
                    live_engines: 0,
                }),
            }),
        }
    }

    pub fn state(&self) -> LoadState {
        self.shared.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() != LoadState::Unloaded
    }

    /// Engines created through this gate that have not been closed yet.
    pub fn live_engines(&self) -> usize {
        self.shared.registry.lock().live_engines
    }

    pub fn load_cpu(&self, binaries: CpuBinaries) -> Result<(), GateError> {
        self.load(&NativeBinaries::cpu(binaries))
    }

    pub fn load_cuda(&self, binaries: CudaBinaries) -> Result<(), GateError> {
        self.load(&NativeBinaries::cuda(binaries))
    }

    /// Load every component of `binaries` in order.
    ///
    /// All or nothing: if a component fails, the ones already loaded are
    /// unloaded again and the gate stays `Unloaded`.
    pub fn load(&self, binaries: &NativeBinaries) -> Result<(), GateError> {
        let mut registry = self.shared.registry.lock();

        let current = self.shared.state();
        if current != LoadState::Unloaded {
            return Err(GateError::AlreadyLoaded(current));
        }

        let mut loaded = Vec::new();
        for (component, path) in binaries.components() {
            if let Err(source) = self.shared.loader.load(component, path) {
                warn!(
                    component = %component,
                    rolled_back = loaded.len(),
                    "Native load failed, rolling back"
                );
                self.shared.unload_all(loaded);
                return Err(GateError::LoadFailure { component, source });
            }
            loaded.push((component, path.to_path_buf()));
        }

        registry.loaded = loaded;
        self.shared.set_state(LoadState::Loaded(binaries.backend()));

        info!(backend = %binaries.backend(), "Native binaries loaded");
        Ok(())
    }

    /// Unload explicitly. Fails while engines created through the gate are alive.
    pub fn unload(&self) -> Result<(), GateError> {
        let mut registry = self.shared.registry.lock();
        if registry.live_engines > 0 {
            return Err(GateError::EnginesAlive(registry.live_engines));
        }
        if self.shared.state() == LoadState::Unloaded {
            return Ok(());
        }

        let loaded = std::mem::take(&mut registry.loaded);
        self.shared.unload_all(loaded);
        self.shared.set_state(LoadState::Unloaded);

        info!("Native binaries unloaded");
        Ok(())
    }

    /// Create a text-generation session bound to the loaded backend.
    ///
    /// Model initialization runs under the gate lock, so a concurrent
    /// unload cannot slip in between the state check and registration.
    pub fn create(&self, options: CreateOptions) -> Result<TextGeneration, GateError> {
        let mut registry = self.shared.registry.lock();

        let backend = match self.shared.state() {
            LoadState::Unloaded => return Err(GateError::NotLoaded),
            LoadState::Loaded(backend) => backend,
        };

        options.validate()?;

        let model_params = match backend {
            Backend::Cpu => ModelParams::cpu(),
            Backend::Cuda => ModelParams::gpu(),
        };

        let handle = NativeHandle::open(
            self.shared.backend.clone(),
            &options.model_path,
            &model_params,
            &options.context,
        )?;

        registry.live_engines += 1;
        handle.attach_lease(EngineLease {
            shared: self.shared.clone(),
        });
        drop(registry);

        info!(
            backend = %backend,
            model = %options.model_path.display(),
            n_ctx = options.context.n_ctx,
            n_batch = options.context.n_batch,
            "Engine created"
        );

        Ok(TextGeneration::new(handle, &options.system_prompt)
            .with_sampling(options.sampling)
            .with_failure_policy(options.failure_policy))
    }

    /// Convenience for `create(CreateOptions::new(model_path))`.
    pub fn create_default(&self, model_path: &Path) -> Result<TextGeneration, GateError> {
        self.create(CreateOptions::new(model_path))
    }
}
