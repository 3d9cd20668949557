use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::trace;

use crate::backend::spec::{Backend, Dim3, KernelArgs, KernelError, KernelResult, LaunchRequest};
use crate::compiler::LaunchConfig;

/// A compiled overload bound to `(directory, kernel_name)`.
///
/// The backend kernel is resolved on first launch and kept for the handle's lifetime.
pub struct KernelHandle<B: Backend> {
    backend: Arc<B>,
    directory: PathBuf,
    kernel_name: String,
    kernel: OnceLock<B::Kernel>,
}

impl<B: Backend> KernelHandle<B> {
    pub fn new(
        backend: Arc<B>,
        directory: impl Into<PathBuf>,
        kernel_name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            directory: directory.into(),
            kernel_name: kernel_name.into(),
            kernel: OnceLock::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Loads through the backend cache on first use.
    pub fn kernel(&self) -> KernelResult<B::Kernel> {
        if let Some(kernel) = self.kernel.get() {
            return Ok(kernel.clone());
        }
        let kernel = self.backend.load_kernel(&self.directory, &self.kernel_name)?;
        Ok(self.kernel.get_or_init(|| kernel).clone())
    }

    pub fn launch(
        &self,
        stream: B::Stream,
        config: &LaunchConfig,
        args: KernelArgs<'_>,
        signature: Option<&str>,
    ) -> KernelResult<()> {
        let kernel = self.kernel()?;
        let threads = config.num_warps.checked_mul(B::WARP_SIZE).ok_or_else(|| {
            KernelError::invalid_argument(format!(
                "{} warps overflow the block size",
                config.num_warps
            ))
        })?;
        let block = Dim3::linear(threads);
        let shared_memory_bytes = self.backend.shared_memory(&self.directory, &self.kernel_name)?;

        let metadata = if self.backend.wants_arg_layout() {
            self.backend.kernel_metadata(&self.directory, &self.kernel_name)?
        } else {
            None
        };
        let arg_layout = metadata
            .as_deref()
            .and_then(|metadata| metadata.arg_layout.as_deref());

        trace!(
            "launching {} grid={} block={} shared={}",
            self.kernel_name,
            config.grid,
            block,
            shared_memory_bytes
        );
        self.backend.launch(
            stream,
            LaunchRequest {
                kernel: &kernel,
                grid: config.grid,
                block,
                shared_memory_bytes,
                args,
                signature,
                arg_layout,
            },
        )
    }
}

impl<B: Backend> fmt::Debug for KernelHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("backend", &B::NAME)
            .field("directory", &self.directory)
            .field("kernel_name", &self.kernel_name)
            .field("loaded", &self.kernel.get().is_some())
            .finish()
    }
}
