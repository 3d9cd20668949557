use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use libloading::Library;
use log::debug;
use triton_jit::env::non_empty_var;
use triton_jit::{Dim3, KernelError, KernelResult};

pub const CUDA_LIBRARY_ENV: &str = "TRITON_JIT_CUDA_LIBRARY";

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;

/// `CUdevice_attribute` values used by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceAttribute {
    ComputeCapabilityMajor = 75,
    ComputeCapabilityMinor = 76,
    MaxSharedMemoryPerMultiprocessor = 81,
    MaxSharedMemoryPerBlockOptin = 97,
}

/// `CUfunction_attribute` values used by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FunctionAttribute {
    SharedSizeBytes = 1,
    MaxDynamicSharedSizeBytes = 8,
}

/// `CUfunc_cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FuncCache {
    PreferNone = 0,
    PreferShared = 1,
    PreferL1 = 2,
    PreferEqual = 3,
}

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        // Stored as usize so handles are Send + Sync.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_addr(addr: usize) -> Self {
                Self(addr)
            }

            pub fn from_raw(ptr: *mut c_void) -> Self {
                Self(ptr as usize)
            }

            pub fn as_raw(self) -> *mut c_void {
                self.0 as *mut c_void
            }

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

raw_handle!(
    /// A `CUstream`; the default value is the legacy default stream.
    CuStream
);
raw_handle!(
    /// A `CUcontext`.
    CuContext
);
raw_handle!(
    /// A loaded `CUmodule`.
    CuModule
);
raw_handle!(
    /// A `CUfunction` resolved from a module.
    CuFunction
);

/// The slice of the CUDA driver API the backend needs.
///
/// [`CudaDriver`] implements it over the real `libcuda`; tests substitute fakes.
pub trait CudaApi: Send + Sync + 'static {
    /// Current context of the calling thread, `None` when there is none.
    fn current_context(&self) -> KernelResult<Option<CuContext>>;

    /// Creates a context on device `ordinal` and makes it current.
    fn create_context(&self, ordinal: i32) -> KernelResult<CuContext>;

    fn current_device(&self) -> KernelResult<i32>;

    fn device_attribute(&self, attribute: DeviceAttribute, device: i32) -> KernelResult<i32>;

    fn load_module(&self, image: &[u8]) -> KernelResult<CuModule>;

    fn unload_module(&self, module: CuModule) -> KernelResult<()>;

    fn module_function(&self, module: CuModule, name: &str) -> KernelResult<CuFunction>;

    fn set_cache_config(&self, function: CuFunction, config: FuncCache) -> KernelResult<()>;

    fn function_attribute(
        &self,
        function: CuFunction,
        attribute: FunctionAttribute,
    ) -> KernelResult<i32>;

    fn set_function_attribute(
        &self,
        function: CuFunction,
        attribute: FunctionAttribute,
        value: i32,
    ) -> KernelResult<()>;

    /// Enqueues `function` on `stream`.
    ///
    /// # Safety
    ///
    /// `params` must hold one pointer per kernel parameter, each pointing at a
    /// value of that parameter's type, valid until the call returns.
    unsafe fn launch_kernel(
        &self,
        function: CuFunction,
        grid: Dim3,
        block: Dim3,
        shared_memory_bytes: u32,
        stream: CuStream,
        params: &mut [*mut c_void],
    ) -> KernelResult<()>;
}

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attribute: i32, device: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxGetCurrentFn = unsafe extern "C" fn(ctx: *mut CUcontext) -> CUresult;
type CuCtxGetDeviceFn = unsafe extern "C" fn(device: *mut CUdevice) -> CUresult;
type CuModuleLoadDataFn =
    unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuFuncSetCacheConfigFn = unsafe extern "C" fn(hfunc: CUfunction, config: i32) -> CUresult;
type CuFuncGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attribute: i32, hfunc: CUfunction) -> CUresult;
type CuFuncSetAttributeFn =
    unsafe extern "C" fn(hfunc: CUfunction, attribute: i32, value: i32) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;
type CuGetErrorStringFn = unsafe extern "C" fn(error: CUresult, string: *mut *const c_char) -> CUresult;

struct DriverFns {
    cu_device_get: CuDeviceGetFn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_get_current: CuCtxGetCurrentFn,
    cu_ctx_get_device: CuCtxGetDeviceFn,
    cu_module_load_data: CuModuleLoadDataFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_func_set_cache_config: CuFuncSetCacheConfigFn,
    cu_func_get_attribute: CuFuncGetAttributeFn,
    cu_func_set_attribute: CuFuncSetAttributeFn,
    cu_launch_kernel: CuLaunchKernelFn,
    cu_get_error_string: CuGetErrorStringFn,
}

/// Dynamically loaded CUDA driver.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // contexts this driver created; destroyed on drop
    owned_contexts: Mutex<Vec<CuContext>>,
}

impl fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDriver").finish_non_exhaustive()
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        let contexts = match self.owned_contexts.get_mut() {
            Ok(contexts) => std::mem::take(contexts),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for ctx in contexts {
            // SAFETY: the context was created by this driver and is destroyed once.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(ctx.as_raw()) };
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, loaded on first use.
pub fn driver() -> KernelResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(KernelError::Unavailable {
            backend: "cuda",
            reason: msg.clone(),
        }),
    }
}

impl CudaDriver {
    fn new() -> KernelResult<Self> {
        let lib = load_cuda_library()?;
        let cu_init: CuInitFn = load_symbol(&lib, b"cuInit\0")?;
        let fns = DriverFns {
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_get_current: load_symbol(&lib, b"cuCtxGetCurrent\0")?,
            cu_ctx_get_device: load_symbol(&lib, b"cuCtxGetDevice\0")?,
            cu_module_load_data: load_symbol(&lib, b"cuModuleLoadData\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_func_set_cache_config: load_symbol(&lib, b"cuFuncSetCacheConfig\0")?,
            cu_func_get_attribute: load_symbol(&lib, b"cuFuncGetAttribute\0")?,
            cu_func_set_attribute: load_symbol(&lib, b"cuFuncSetAttribute\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
            cu_get_error_string: load_symbol(&lib, b"cuGetErrorString\0")?,
        };
        let driver = Self {
            _lib: lib,
            fns,
            owned_contexts: Mutex::new(Vec::new()),
        };
        // SAFETY: cuInit takes no pointers and may be called repeatedly.
        driver.check(unsafe { cu_init(0) }, "cuInit")?;
        Ok(driver)
    }

    fn check(&self, code: CUresult, op: &'static str) -> KernelResult<()> {
        if code == CUDA_SUCCESS {
            return Ok(());
        }
        let mut message: *const c_char = std::ptr::null();
        // SAFETY: out pointer is valid; the driver returns a static string or leaves it null.
        let described = unsafe { (self.fns.cu_get_error_string)(code, &mut message) };
        let message = if described == CUDA_SUCCESS && !message.is_null() {
            // SAFETY: cuGetErrorString yields a NUL-terminated static string.
            unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
        } else {
            "unknown CUDA error".to_string()
        };
        Err(KernelError::driver(op, code, message))
    }
}

impl CudaApi for CudaDriver {
    fn current_context(&self) -> KernelResult<Option<CuContext>> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer.
        let code = unsafe { (self.fns.cu_ctx_get_current)(&mut ctx) };
        if code != CUDA_SUCCESS || ctx.is_null() {
            return Ok(None);
        }
        Ok(Some(CuContext::from_raw(ctx)))
    }

    fn create_context(&self, ordinal: i32) -> KernelResult<CuContext> {
        let mut dev: CUdevice = 0;
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: out pointers are valid for the duration of each call.
        unsafe {
            self.check((self.fns.cu_device_get)(&mut dev, ordinal), "cuDeviceGet")?;
            self.check((self.fns.cu_ctx_create_v2)(&mut ctx, 0, dev), "cuCtxCreate_v2")?;
        }
        let ctx = CuContext::from_raw(ctx);
        self.owned_contexts
            .lock()
            .map_err(|_| KernelError::LockPoisoned("cuda context"))?
            .push(ctx);
        Ok(ctx)
    }

    fn current_device(&self) -> KernelResult<i32> {
        let mut device: CUdevice = 0;
        // SAFETY: `device` is a valid out pointer.
        self.check(unsafe { (self.fns.cu_ctx_get_device)(&mut device) }, "cuCtxGetDevice")?;
        Ok(device)
    }

    fn device_attribute(&self, attribute: DeviceAttribute, device: i32) -> KernelResult<i32> {
        let mut value = 0;
        // SAFETY: `value` is a valid out pointer.
        self.check(
            unsafe { (self.fns.cu_device_get_attribute)(&mut value, attribute as i32, device) },
            "cuDeviceGetAttribute",
        )?;
        Ok(value)
    }

    fn load_module(&self, image: &[u8]) -> KernelResult<CuModule> {
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: image is a complete cubin/fatbin or NUL-terminated PTX buffer
        // that outlives the call; the driver copies it.
        self.check(
            unsafe { (self.fns.cu_module_load_data)(&mut module, image.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        Ok(CuModule::from_raw(module))
    }

    fn unload_module(&self, module: CuModule) -> KernelResult<()> {
        // SAFETY: module was loaded by this driver and is unloaded once by its owner.
        self.check(unsafe { (self.fns.cu_module_unload)(module.as_raw()) }, "cuModuleUnload")
    }

    fn module_function(&self, module: CuModule, name: &str) -> KernelResult<CuFunction> {
        let c_name = CString::new(name)
            .map_err(|_| KernelError::invalid_argument("kernel name contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module handle and out pointer are valid.
        self.check(
            unsafe {
                (self.fns.cu_module_get_function)(&mut function, module.as_raw(), c_name.as_ptr())
            },
            "cuModuleGetFunction",
        )?;
        Ok(CuFunction::from_raw(function))
    }

    fn set_cache_config(&self, function: CuFunction, config: FuncCache) -> KernelResult<()> {
        // SAFETY: function handle came from cuModuleGetFunction.
        self.check(
            unsafe { (self.fns.cu_func_set_cache_config)(function.as_raw(), config as i32) },
            "cuFuncSetCacheConfig",
        )
    }

    fn function_attribute(
        &self,
        function: CuFunction,
        attribute: FunctionAttribute,
    ) -> KernelResult<i32> {
        let mut value = 0;
        // SAFETY: function handle and out pointer are valid.
        self.check(
            unsafe {
                (self.fns.cu_func_get_attribute)(&mut value, attribute as i32, function.as_raw())
            },
            "cuFuncGetAttribute",
        )?;
        Ok(value)
    }

    fn set_function_attribute(
        &self,
        function: CuFunction,
        attribute: FunctionAttribute,
        value: i32,
    ) -> KernelResult<()> {
        // SAFETY: function handle came from cuModuleGetFunction.
        self.check(
            unsafe {
                (self.fns.cu_func_set_attribute)(function.as_raw(), attribute as i32, value)
            },
            "cuFuncSetAttribute",
        )
    }

    unsafe fn launch_kernel(
        &self,
        function: CuFunction,
        grid: Dim3,
        block: Dim3,
        shared_memory_bytes: u32,
        stream: CuStream,
        params: &mut [*mut c_void],
    ) -> KernelResult<()> {
        // SAFETY: parameter validity is guaranteed by the caller.
        let code = unsafe {
            (self.fns.cu_launch_kernel)(
                function.as_raw(),
                grid.x,
                grid.y,
                grid.z,
                block.x,
                block.y,
                block.z,
                shared_memory_bytes,
                stream.as_raw(),
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };
        self.check(code, "cuLaunchKernel")
    }
}

fn load_cuda_library() -> KernelResult<Library> {
    let overridden = non_empty_var(&[CUDA_LIBRARY_ENV]);
    let defaults = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];
    let candidates: Vec<&str> = match overridden.as_deref() {
        Some(path) => vec![path],
        None => defaults.to_vec(),
    };

    for candidate in &candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            debug!("loaded CUDA driver from {candidate}");
            return Ok(lib);
        }
    }

    Err(KernelError::Unavailable {
        backend: "cuda",
        reason: format!(
            "failed to load CUDA driver library (tried {})",
            candidates.join(", ")
        ),
    })
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> KernelResult<T> {
    // SAFETY: Caller provides expected symbol type from CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| KernelError::Unavailable {
        backend: "cuda",
        reason: format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ),
    })?;
    Ok(*sym)
}
