//! CUDA driver backend for `triton-jit`.
//!
//! Kernels are loaded from `<dir>/<name>.cubin` (falling back to `.fatbin` and
//! `.ptx`) and launched with `cuLaunchKernel`, one pointer per argument.

pub mod device;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use triton_jit::artifact::{BinaryFormat, KernelBinary};
use triton_jit::backend::compat::{
    check_arch, dynamic_shared_limit, plan_shared_memory, SharedMemoryPlan,
};
use triton_jit::{
    Backend, KernelKey, KernelMetadata, KernelResult, LaunchRequest, ModuleCache,
    ModuleCacheEntry, TypePolicy,
};

pub use device::{
    driver, is_available, CuContext, CuFunction, CuModule, CuStream, CudaApi, CudaDriver,
    DeviceAttribute, FuncCache, FunctionAttribute,
};

/// `cubin` first, then `fatbin`, then `ptx`.
pub const CUDA_BINARY_FORMAT: BinaryFormat = BinaryFormat::new("cubin", &["fatbin", "ptx"]);

/// Facade bound to the CUDA backend.
pub type JitFunction = triton_jit::JitFunction<CudaBackend>;
/// Registry bound to the CUDA backend.
pub type JitRegistry = triton_jit::JitRegistry<CudaBackend>;

/// A loaded module; unloaded when its cache entry is dropped.
pub struct CudaModule<D: CudaApi> {
    driver: Arc<D>,
    module: CuModule,
}

impl<D: CudaApi> CudaModule<D> {
    pub fn raw(&self) -> CuModule {
        self.module
    }
}

impl<D: CudaApi> Drop for CudaModule<D> {
    fn drop(&mut self) {
        if let Err(err) = self.driver.unload_module(self.module) {
            warn!("failed to unload CUDA module: {err}");
        }
    }
}

impl<D: CudaApi> fmt::Debug for CudaModule<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CudaModule").field(&self.module).finish()
    }
}

/// CUDA implementation of [`Backend`], owning the module cache for its driver.
pub struct CudaBackend<D: CudaApi = CudaDriver> {
    driver: Arc<D>,
    modules: ModuleCache<CudaModule<D>, CuFunction>,
    type_policy: TypePolicy,
}

impl CudaBackend<CudaDriver> {
    /// Backend over the process-wide `libcuda`.
    pub fn new() -> KernelResult<Self> {
        Ok(Self::with_driver(driver()?))
    }

    pub fn is_available() -> bool {
        is_available()
    }
}

impl<D: CudaApi> CudaBackend<D> {
    pub fn with_driver(driver: Arc<D>) -> Self {
        Self {
            driver,
            modules: ModuleCache::new("cuda module"),
            type_policy: TypePolicy::from_env(),
        }
    }

    pub fn with_type_policy(mut self, type_policy: TypePolicy) -> Self {
        self.type_policy = type_policy;
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Number of distinct kernels loaded so far.
    pub fn cached_kernels(&self) -> KernelResult<usize> {
        self.modules.len()
    }

    fn load_entry(
        &self,
        dir: &Path,
        kernel_name: &str,
    ) -> KernelResult<ModuleCacheEntry<CudaModule<D>, CuFunction>> {
        let metadata = KernelMetadata::load(dir, kernel_name, self.type_policy)?;
        let device = self.driver.current_device()?;

        if let Some(kernel_arch) = metadata.target_arch {
            let major = self
                .driver
                .device_attribute(DeviceAttribute::ComputeCapabilityMajor, device)?;
            let minor = self
                .driver
                .device_attribute(DeviceAttribute::ComputeCapabilityMinor, device)?;
            let device_arch = u32::try_from(major * 10 + minor).unwrap_or(0);
            check_arch(device_arch, kernel_arch)?;
        }
        info!(
            "loading kernel {kernel_name} from {} (arch={:?}, shared={})",
            dir.display(),
            metadata.target_arch,
            metadata.shared_memory_bytes
        );

        let binary = KernelBinary::read(dir, kernel_name, &CUDA_BINARY_FORMAT)?;
        let mut image = binary.bytes;
        if binary.path.extension().is_some_and(|ext| ext == "ptx") && image.last() != Some(&0) {
            image.push(0);
        }
        let module = CudaModule {
            driver: Arc::clone(&self.driver),
            module: self.driver.load_module(&image)?,
        };
        let function = self.driver.module_function(module.module, kernel_name)?;
        self.configure_shared_memory(function, device, metadata.shared_memory_bytes)?;

        Ok(ModuleCacheEntry {
            module,
            function,
            metadata: Arc::new(metadata),
        })
    }

    fn configure_shared_memory(
        &self,
        function: CuFunction,
        device: i32,
        required: u32,
    ) -> KernelResult<()> {
        if required == 0 {
            return Ok(());
        }
        let optin = self
            .driver
            .device_attribute(DeviceAttribute::MaxSharedMemoryPerBlockOptin, device)?;
        let optin = u32::try_from(optin).unwrap_or(0);
        if plan_shared_memory(required, optin)? == SharedMemoryPlan::Default {
            return Ok(());
        }

        debug!("configuring large shared memory: required={required}, max={optin}");
        self.driver.set_cache_config(function, FuncCache::PreferShared)?;
        let total = self
            .driver
            .device_attribute(DeviceAttribute::MaxSharedMemoryPerMultiprocessor, device)?;
        let static_bytes = self
            .driver
            .function_attribute(function, FunctionAttribute::SharedSizeBytes)?;
        let dynamic = dynamic_shared_limit(optin, u32::try_from(static_bytes).unwrap_or(0));
        debug!("shared memory: total={total}, static={static_bytes}, dynamic={dynamic}");
        self.driver.set_function_attribute(
            function,
            FunctionAttribute::MaxDynamicSharedSizeBytes,
            i32::try_from(dynamic).unwrap_or(i32::MAX),
        )
    }
}

impl<D: CudaApi> Backend for CudaBackend<D> {
    type Stream = CuStream;
    type Context = CuContext;
    type Kernel = CuFunction;

    const NAME: &'static str = "cuda";
    const VERSION: &'static str = env!("CARGO_PKG_VERSION");
    const WARP_SIZE: u32 = 32;

    fn ensure_context(&self) -> KernelResult<CuContext> {
        if let Some(ctx) = self.driver.current_context()? {
            return Ok(ctx);
        }
        warn!("no CUDA context found, creating a default context on device 0");
        self.driver.create_context(0)
    }

    fn device_index(&self) -> KernelResult<i32> {
        self.driver.current_device()
    }

    fn load_kernel(&self, dir: &Path, kernel_name: &str) -> KernelResult<CuFunction> {
        let key = KernelKey::new(dir, kernel_name);
        let entry = self
            .modules
            .get_or_load(&key, || self.load_entry(dir, kernel_name))?;
        Ok(entry.function)
    }

    fn shared_memory(&self, dir: &Path, kernel_name: &str) -> KernelResult<u32> {
        let key = KernelKey::new(dir, kernel_name);
        Ok(self
            .modules
            .metadata_or_load(&key, self.type_policy)?
            .shared_memory_bytes)
    }

    fn kernel_metadata(
        &self,
        dir: &Path,
        kernel_name: &str,
    ) -> KernelResult<Option<Arc<KernelMetadata>>> {
        let key = KernelKey::new(dir, kernel_name);
        Ok(self
            .modules
            .get(&key)?
            .map(|entry| Arc::clone(&entry.metadata)))
    }

    fn launch(&self, stream: CuStream, request: LaunchRequest<'_, CuFunction>) -> KernelResult<()> {
        let mut params = request.args.pointers();
        debug!(
            "cuLaunchKernel grid={} block={} shared={} args={}",
            request.grid,
            request.block,
            request.shared_memory_bytes,
            params.len()
        );
        // SAFETY: packed arguments point into a buffer borrowed for the request's
        // lifetime; raw arguments carry the `KernelArgs::from_raw` contract.
        unsafe {
            self.driver.launch_kernel(
                *request.kernel,
                request.grid,
                request.block,
                request.shared_memory_bytes,
                stream,
                &mut params,
            )
        }
    }
}

impl<D: CudaApi> fmt::Debug for CudaBackend<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBackend")
            .field("modules", &self.modules)
            .field("type_policy", &self.type_policy)
            .finish_non_exhaustive()
    }
}
