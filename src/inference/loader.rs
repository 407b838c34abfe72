//! Native binary sets and the loader that brings them into the process.
//!
//! The binaries must be loaded in dependency order: ggml-base, ggml-cpu,
//! (ggml-cuda), ggml-rpc, ggml, llama, and finally the text-generation
//! bridge.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Native binary not found: {0}")]
    NotFound(String),

    #[error("Failed to load {component}: {reason}")]
    LoadFailed {
        component: NativeComponent,
        reason: String,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Compute backend a binary set targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "CPU"),
            Backend::Cuda => write!(f, "CUDA"),
        }
    }
}

/// One native library of the inference stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NativeComponent {
    GgmlBase,
    GgmlCpu,
    GgmlCuda,
    GgmlRpc,
    Ggml,
    Llama,
    TextGeneration,
}

impl NativeComponent {
    /// Library name without platform prefix or suffix.
    pub fn library_name(&self) -> &'static str {
        match self {
            NativeComponent::GgmlBase => "ggml-base",
            NativeComponent::GgmlCpu => "ggml-cpu",
            NativeComponent::GgmlCuda => "ggml-cuda",
            NativeComponent::GgmlRpc => "ggml-rpc",
            NativeComponent::Ggml => "ggml",
            NativeComponent::Llama => "llama",
            NativeComponent::TextGeneration => "text-generation",
        }
    }

    /// Platform file name, e.g. `libllama.so` or `llama.dll`.
    pub fn file_name(&self) -> String {
        format!("{DLL_PREFIX}{}{DLL_SUFFIX}", self.library_name())
    }
}

impl fmt::Display for NativeComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.library_name())
    }
}

/// Paths of the CPU binary set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuBinaries {
    pub ggml_base: PathBuf,
    pub ggml_cpu: PathBuf,
    pub ggml_rpc: PathBuf,
    pub ggml: PathBuf,
    pub llama: PathBuf,
    pub text_generation: PathBuf,
}

/// Paths of the CUDA binary set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CudaBinaries {
    pub ggml_base: PathBuf,
    pub ggml_cpu: PathBuf,
    pub ggml_cuda: PathBuf,
    pub ggml_rpc: PathBuf,
    pub ggml: PathBuf,
    pub llama: PathBuf,
    pub text_generation: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeBinaries {
    Cpu(CpuBinaries),
    Cuda(CudaBinaries),
}

impl NativeBinaries {
    /// CPU set from explicit paths.
    pub fn cpu(binaries: CpuBinaries) -> Self {
        NativeBinaries::Cpu(binaries)
    }

    /// CUDA set from explicit paths.
    pub fn cuda(binaries: CudaBinaries) -> Self {
        NativeBinaries::Cuda(binaries)
    }

    /// Resolve the binary set for `backend` inside `dir` using platform file names.
    pub fn in_dir(dir: &Path, backend: Backend) -> Self {
        let path = |component: NativeComponent| dir.join(component.file_name());
        match backend {
            Backend::Cpu => NativeBinaries::cpu(CpuBinaries {
                ggml_base: path(NativeComponent::GgmlBase),
                ggml_cpu: path(NativeComponent::GgmlCpu),
                ggml_rpc: path(NativeComponent::GgmlRpc),
                ggml: path(NativeComponent::Ggml),
                llama: path(NativeComponent::Llama),
                text_generation: path(NativeComponent::TextGeneration),
            }),
            Backend::Cuda => NativeBinaries::cuda(CudaBinaries {
                ggml_base: path(NativeComponent::GgmlBase),
                ggml_cpu: path(NativeComponent::GgmlCpu),
                ggml_cuda: path(NativeComponent::GgmlCuda),
                ggml_rpc: path(NativeComponent::GgmlRpc),
                ggml: path(NativeComponent::Ggml),
                llama: path(NativeComponent::Llama),
                text_generation: path(NativeComponent::TextGeneration),
            }),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            NativeBinaries::Cpu(_) => Backend::Cpu,
            NativeBinaries::Cuda(_) => Backend::Cuda,
        }
    }

    /// Components in load order.
    pub fn components(&self) -> Vec<(NativeComponent, &Path)> {
        match self {
            NativeBinaries::Cpu(b) => vec![
                (NativeComponent::GgmlBase, b.ggml_base.as_path()),
                (NativeComponent::GgmlCpu, b.ggml_cpu.as_path()),
                (NativeComponent::GgmlRpc, b.ggml_rpc.as_path()),
                (NativeComponent::Ggml, b.ggml.as_path()),
                (NativeComponent::Llama, b.llama.as_path()),
                (NativeComponent::TextGeneration, b.text_generation.as_path()),
            ],
            NativeBinaries::Cuda(b) => vec![
                (NativeComponent::GgmlBase, b.ggml_base.as_path()),
                (NativeComponent::GgmlCpu, b.ggml_cpu.as_path()),
                (NativeComponent::GgmlCuda, b.ggml_cuda.as_path()),
                (NativeComponent::GgmlRpc, b.ggml_rpc.as_path()),
                (NativeComponent::Ggml, b.ggml.as_path()),
                (NativeComponent::Llama, b.llama.as_path()),
                (NativeComponent::TextGeneration, b.text_generation.as_path()),
            ],
        }
    }
}

/// Brings one native component into (and out of) the process.
pub trait NativeLoader: Send + Sync {
    fn load(&self, component: NativeComponent, path: &Path) -> Result<(), LoaderError>;

    fn unload(&self, component: NativeComponent, path: &Path) -> Result<(), LoaderError>;
}

/// Loader that verifies each binary exists and keeps a registry of what is loaded.
///
/// Symbol resolution happens at link time against the host application,
/// so loading a component here amounts to validating the file and
/// recording it.
#[derive(Default)]
pub struct FileLoader {
    loaded: Mutex<Vec<(NativeComponent, PathBuf)>>,
}

impl FileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Components currently registered, in load order.
    pub fn loaded(&self) -> Vec<NativeComponent> {
        self.loaded.lock().iter().map(|(c, _)| *c).collect()
    }
}

impl NativeLoader for FileLoader {
    fn load(&self, component: NativeComponent, path: &Path) -> Result<(), LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound(path.display().to_string()));
        }

        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(LoaderError::LoadFailed {
                component,
                reason: format!("{} is not a file", path.display()),
            });
        }

        info!(
            component = %component,
            path = %path.display(),
            bytes = metadata.len(),
            "Loaded native component"
        );

        self.loaded.lock().push((component, path.to_path_buf()));
        Ok(())
    }

    fn unload(&self, component: NativeComponent, path: &Path) -> Result<(), LoaderError> {
        let mut loaded = self.loaded.lock();
        match loaded.iter().rposition(|(c, p)| *c == component && p == path) {
            Some(index) => {
                loaded.remove(index);
                Ok(())
            }
            None => Err(LoaderError::LoadFailed {
                component,
                reason: "component is not loaded".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_load_order() {
        let binaries = NativeBinaries::in_dir(Path::new("bin"), Backend::Cpu);
        let order: Vec<_> = binaries.components().into_iter().map(|(c, _)| c).collect();
        assert_eq!(
            order,
            vec![
                NativeComponent::GgmlBase,
                NativeComponent::GgmlCpu,
                NativeComponent::GgmlRpc,
                NativeComponent::Ggml,
                NativeComponent::Llama,
                NativeComponent::TextGeneration,
            ]
        );
    }

    #[test]
    fn test_cuda_inserts_ggml_cuda_after_cpu() {
        let binaries = NativeBinaries::in_dir(Path::new("bin"), Backend::Cuda);
        let order: Vec<_> = binaries.components().into_iter().map(|(c, _)| c).collect();
        assert_eq!(order.len(), 7);
        assert_eq!(order[1], NativeComponent::GgmlCpu);
        assert_eq!(order[2], NativeComponent::GgmlCuda);
        assert_eq!(binaries.backend(), Backend::Cuda);
    }

    #[test]
    fn test_explicit_paths_keep_load_order() {
        let binaries = NativeBinaries::cpu(CpuBinaries {
            ggml_base: PathBuf::from("/opt/a/base.so"),
            ggml_cpu: PathBuf::from("/opt/b/cpu.so"),
            ggml_rpc: PathBuf::from("/opt/c/rpc.so"),
            ggml: PathBuf::from("/opt/d/ggml.so"),
            llama: PathBuf::from("/opt/e/llama.so"),
            text_generation: PathBuf::from("/opt/f/bridge.so"),
        });
        assert_eq!(binaries.backend(), Backend::Cpu);

        let components = binaries.components();
        assert_eq!(components[0], (NativeComponent::GgmlBase, Path::new("/opt/a/base.so")));
        assert_eq!(
            components[5],
            (NativeComponent::TextGeneration, Path::new("/opt/f/bridge.so"))
        );
    }

    #[test]
    fn test_platform_file_names() {
        let name = NativeComponent::Llama.file_name();
        assert!(name.starts_with(DLL_PREFIX));
        assert!(name.ends_with(DLL_SUFFIX));
        assert!(name.contains("llama"));
    }

    #[test]
    fn test_file_loader_missing_file() {
        let loader = FileLoader::new();
        let err = loader
            .load(NativeComponent::Ggml, Path::new("/nonexistent/libggml.so"))
            .unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(_)));
        assert!(loader.loaded().is_empty());
    }

    #[test]
    fn test_file_loader_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NativeComponent::Llama.file_name());
        std::fs::write(&path, b"\x7fELF").unwrap();

        let loader = FileLoader::new();
        loader.load(NativeComponent::Llama, &path).unwrap();
        assert_eq!(loader.loaded(), vec![NativeComponent::Llama]);

        loader.unload(NativeComponent::Llama, &path).unwrap();
        assert!(loader.loaded().is_empty());
        assert!(loader.unload(NativeComponent::Llama, &path).is_err());
    }
}
