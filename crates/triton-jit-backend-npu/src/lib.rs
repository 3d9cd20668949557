//! Ascend NPU runtime backend for `triton-jit`.
//!
//! Kernels are registered from `<dir>/<name>.npubin` (falling back to `.o`,
//! `.ttadapter` and `.bin`) through `rtDevBinaryRegister`/`rtFunctionRegister`
//! and launched with `rtKernelLaunch`, which takes a single packed argument
//! block rather than per-argument pointers.

pub mod args;
pub mod device;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use triton_jit::artifact::{BinaryFormat, KernelBinary};
use triton_jit::kernel_cache::lock_named;
use triton_jit::{
    parse_signature_with, ArgDescriptor, Backend, KernelError, KernelKey, KernelMetadata,
    KernelResult, LaunchRequest, ModuleCache, ModuleCacheEntry, ReservedField, TypePolicy,
};

pub use args::{pack_launch_block, SYSTEM_HEADER};
pub use device::{
    driver, is_available, AclContext, AclStream, AscendApi, AscendDriver, FunctionStub,
    RtBinary, StubHandle, RT_DEV_BINARY_MAGIC_ELF, RT_DEV_BINARY_MAGIC_ELF_AICUBE,
    RT_DEV_BINARY_MAGIC_ELF_AIVEC,
};

/// `npubin` first, then `o`, `ttadapter` and `bin`.
pub const NPU_BINARY_FORMAT: BinaryFormat =
    BinaryFormat::new("npubin", &["o", "ttadapter", "bin"]);

/// Facade bound to the NPU backend.
pub type JitFunction = triton_jit::JitFunction<NpuBackend>;
/// Registry bound to the NPU backend.
pub type JitRegistry = triton_jit::JitRegistry<NpuBackend>;

/// Registration magic for a kernel's `mix_mode`.
pub fn binary_magic(mix_mode: Option<&str>) -> u32 {
    match mix_mode {
        Some("aiv") => RT_DEV_BINARY_MAGIC_ELF_AIVEC,
        Some("aic") => RT_DEV_BINARY_MAGIC_ELF_AICUBE,
        _ => RT_DEV_BINARY_MAGIC_ELF,
    }
}

/// A registered binary and the stub its function is launched through.
#[derive(Debug)]
pub struct NpuModule {
    pub binary: RtBinary,
    pub stub: FunctionStub,
}

/// NPU implementation of [`Backend`].
pub struct NpuBackend<D: AscendApi = AscendDriver> {
    driver: Arc<D>,
    modules: ModuleCache<NpuModule, StubHandle>,
    registrations: Mutex<HashMap<String, usize>>,
    owned_contexts: Mutex<Vec<AclContext>>,
    type_policy: TypePolicy,
}

impl NpuBackend<AscendDriver> {
    /// Backend over the process-wide AscendCL and runtime libraries.
    pub fn new() -> KernelResult<Self> {
        Ok(Self::with_driver(driver()?))
    }

    pub fn is_available() -> bool {
        is_available()
    }
}

impl<D: AscendApi> NpuBackend<D> {
    pub fn with_driver(driver: Arc<D>) -> Self {
        Self {
            driver,
            modules: ModuleCache::new("npu module"),
            registrations: Mutex::new(HashMap::new()),
            owned_contexts: Mutex::new(Vec::new()),
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

    pub fn cached_kernels(&self) -> KernelResult<usize> {
        self.modules.len()
    }

    /// Cached entry for a loaded kernel, including its stub.
    pub fn module(
        &self,
        dir: &Path,
        kernel_name: &str,
    ) -> KernelResult<Option<Arc<ModuleCacheEntry<NpuModule, StubHandle>>>> {
        self.modules.get(&KernelKey::new(dir, kernel_name))
    }

    fn next_stub_name(&self, kernel_name: &str) -> KernelResult<String> {
        let mut registrations = lock_named(&self.registrations, "npu stub registry")?;
        let count = registrations.entry(kernel_name.to_string()).or_insert(0);
        let name = format!("{kernel_name}_{count}");
        *count += 1;
        Ok(name)
    }

    fn load_entry(
        &self,
        dir: &Path,
        kernel_name: &str,
    ) -> KernelResult<ModuleCacheEntry<NpuModule, StubHandle>> {
        let metadata = KernelMetadata::load(dir, kernel_name, self.type_policy)?;
        let device = match self.driver.current_device() {
            Ok(device) => device,
            Err(err) => {
                debug!("no current NPU device ({err}), using device 0");
                0
            }
        };
        self.driver.set_device(device)?;

        let binary = KernelBinary::read(dir, kernel_name, &NPU_BINARY_FORMAT)?;
        let magic = binary_magic(metadata.mix_mode.as_deref());
        info!(
            "registering kernel {kernel_name} from {} (mix_mode={:?}, {} bytes)",
            binary.path.display(),
            metadata.mix_mode,
            binary.bytes.len()
        );
        let handle = self.driver.register_binary(&binary.bytes, magic)?;

        let stub = FunctionStub::new(&self.next_stub_name(kernel_name)?, kernel_name)?;
        self.driver.register_function(handle, &stub)?;
        let function = stub.handle();

        Ok(ModuleCacheEntry {
            module: NpuModule {
                binary: handle,
                stub,
            },
            function,
            metadata: Arc::new(metadata),
        })
    }

    fn resolve_layout<'a>(
        &self,
        request: &LaunchRequest<'a, StubHandle>,
    ) -> KernelResult<Cow<'a, [ArgDescriptor]>> {
        if let Some(layout) = request.arg_layout.filter(|layout| !layout.is_empty()) {
            return Ok(Cow::Borrowed(layout));
        }
        match request.signature.filter(|sig| !sig.trim().is_empty()) {
            Some(signature) => Ok(Cow::Owned(parse_signature_with(
                signature,
                self.type_policy,
            )?)),
            None => Err(KernelError::invalid_argument(
                "no signature or arg_layout provided",
            )),
        }
    }
}

impl<D: AscendApi> Backend for NpuBackend<D> {
    type Stream = AclStream;
    type Context = AclContext;
    type Kernel = StubHandle;

    const NAME: &'static str = "npu";
    const VERSION: &'static str = env!("CARGO_PKG_VERSION");
    const WARP_SIZE: u32 = 1;
    const RESERVED_HEADER: &'static [ReservedField] = &SYSTEM_HEADER;

    fn wants_arg_layout(&self) -> bool {
        true
    }

    fn ensure_context(&self) -> KernelResult<AclContext> {
        if let Some(ctx) = self.driver.current_context()? {
            return Ok(ctx);
        }
        warn!("no NPU context found, creating a default context on device 0");
        let ctx = self.driver.create_context(0)?;
        lock_named(&self.owned_contexts, "npu context")?.push(ctx);
        Ok(ctx)
    }

    fn device_index(&self) -> KernelResult<i32> {
        self.driver.current_device()
    }

    fn load_kernel(&self, dir: &Path, kernel_name: &str) -> KernelResult<StubHandle> {
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
        Ok(self
            .module(dir, kernel_name)?
            .map(|entry| Arc::clone(&entry.metadata)))
    }

    fn launch(&self, stream: AclStream, request: LaunchRequest<'_, StubHandle>) -> KernelResult<()> {
        let layout = self.resolve_layout(&request)?;
        let block_num = request.grid.volume().ok_or_else(|| {
            KernelError::invalid_argument(format!("grid {} overflows u32", request.grid))
        })?;
        let ffts_addr = self.driver.c2c_ctrl_addr()?;
        let block = pack_launch_block(ffts_addr, &layout, &request.args, request.grid)?;
        debug!(
            "rtKernelLaunch grid={} block_num={block_num} args={} bytes={}",
            request.grid,
            layout.len(),
            block.byte_len()
        );
        self.driver
            .launch_kernel(*request.kernel, block_num, block.data(), stream)
    }
}

/// Destroys the contexts `ensure_context` created.
impl<D: AscendApi> Drop for NpuBackend<D> {
    fn drop(&mut self) {
        let contexts = match self.owned_contexts.get_mut() {
            Ok(contexts) => std::mem::take(contexts),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for ctx in contexts {
            if let Err(err) = self.driver.destroy_context(ctx) {
                warn!("failed to destroy NPU context: {err}");
            }
        }
    }
}

impl<D: AscendApi> fmt::Debug for NpuBackend<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpuBackend")
            .field("modules", &self.modules)
            .field("type_policy", &self.type_policy)
            .finish_non_exhaustive()
    }
}
