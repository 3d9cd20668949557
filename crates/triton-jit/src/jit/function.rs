use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::backend::spec::{Backend, KernelArgs, KernelError, KernelResult};
use crate::compiler::{CompileRequest, KernelCompiler, LaunchConfig};
use crate::kernel_cache::lock_named;
use crate::profiling;

use super::args::{pack_arguments, ArgValue};
use super::kernel::KernelHandle;
use super::static_signature::StaticSignature;

type OverloadKey = (String, i32);

/// Call-site object for one `(file, function)` pair.
///
/// Owns the function's static signature and the overloads compiled for it,
/// keyed by `(full textual signature, device index)`. Overloads are never
/// evicted.
pub struct JitFunction<B: Backend> {
    file_path: PathBuf,
    function_name: String,
    static_signature: StaticSignature,
    backend: Arc<B>,
    compiler: Arc<dyn KernelCompiler>,
    overloads: Mutex<HashMap<OverloadKey, Arc<KernelHandle<B>>>>,
}

impl<B: Backend> JitFunction<B> {
    /// Asks `compiler` for the static signature of `function_name` in `file_path`.
    pub fn new(
        backend: Arc<B>,
        compiler: Arc<dyn KernelCompiler>,
        file_path: impl Into<PathBuf>,
        function_name: impl Into<String>,
    ) -> KernelResult<Self> {
        let file_path = file_path.into();
        let function_name = function_name.into();
        let static_signature = compiler.extract_signature(&file_path, &function_name)?;
        Ok(Self::with_static_signature(
            backend,
            compiler,
            file_path,
            function_name,
            static_signature,
        ))
    }

    pub fn with_static_signature(
        backend: Arc<B>,
        compiler: Arc<dyn KernelCompiler>,
        file_path: impl Into<PathBuf>,
        function_name: impl Into<String>,
        static_signature: StaticSignature,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            function_name: function_name.into(),
            static_signature,
            backend,
            compiler,
            overloads: Mutex::new(HashMap::new()),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn static_signature(&self) -> &StaticSignature {
        &self.static_signature
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn overload_count(&self) -> KernelResult<usize> {
        Ok(lock_named(&self.overloads, "jit overload")?.len())
    }

    /// Packs `args`, resolves the overload for this device and launches it.
    pub fn call(
        &self,
        stream: B::Stream,
        config: &LaunchConfig,
        args: &[ArgValue],
    ) -> KernelResult<()> {
        let packed = pack_arguments(&self.static_signature, args)?;

        self.backend.ensure_context()?;
        let device_index = self.backend.device_index()?;

        let kernel = self.get_kernel(&packed.signature, config, device_index)?;
        kernel.launch(
            stream,
            config,
            KernelArgs::packed(&packed.buffer),
            Some(&packed.signature),
        )
    }

    /// Launches with a caller-built signature and argument pointer array.
    ///
    /// # Safety
    ///
    /// `args` must hold one valid pointer per runtime argument of `signature`
    /// (plus the trailing scratch pointer), each readable for the width of its
    /// type until this call returns.
    pub unsafe fn launch_with_raw_args(
        &self,
        stream: B::Stream,
        config: &LaunchConfig,
        signature: &str,
        args: &[*mut c_void],
    ) -> KernelResult<()> {
        self.backend.ensure_context()?;
        let device_index = self.backend.device_index()?;

        let kernel = self.get_kernel(signature, config, device_index)?;
        // SAFETY: forwarded from this function's contract.
        let args = unsafe { KernelArgs::from_raw(args) };
        kernel.launch(stream, config, args, Some(signature))
    }

    /// Overload for `(signature, device_index)`, compiling it on first use.
    ///
    /// The overload lock is held while compiling, so concurrent first calls
    /// compile once.
    pub fn get_kernel(
        &self,
        signature: &str,
        config: &LaunchConfig,
        device_index: i32,
    ) -> KernelResult<Arc<KernelHandle<B>>> {
        let key: OverloadKey = (signature.to_string(), device_index);
        let mut overloads = lock_named(&self.overloads, "jit overload")?;
        if let Some(found) = overloads.get(&key) {
            profiling::cache_event("overload_hit");
            return Ok(Arc::clone(found));
        }
        profiling::cache_event("overload_miss");

        let directory = {
            let _compile_scope = profiling::compile_scope("jit.compile");
            profiling::cache_event("compile");
            self.compiler.compile(&CompileRequest {
                file_path: &self.file_path,
                function_name: &self.function_name,
                signature,
                num_warps: config.num_warps,
                num_stages: config.num_stages,
                device_index,
            })?
        };
        debug!(
            "{}::{} [{signature}] on device {device_index} -> {}",
            self.file_path.display(),
            self.function_name,
            directory.display()
        );

        let handle = Arc::new(KernelHandle::new(
            Arc::clone(&self.backend),
            directory,
            self.function_name.clone(),
        ));
        match overloads.entry(key) {
            Entry::Occupied(_) => Err(KernelError::CacheInvariantViolation {
                cache: "jit overload",
                key: format!("{signature};{device_index}"),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }
}

impl<B: Backend> fmt::Debug for JitFunction<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitFunction")
            .field("backend", &B::NAME)
            .field("file_path", &self.file_path)
            .field("function_name", &self.function_name)
            .field("static_signature", &self.static_signature)
            .finish_non_exhaustive()
    }
}
