use std::ffi::{c_char, c_void, CString};
use std::fmt;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use log::debug;
use triton_jit::env::non_empty_var;
use triton_jit::{KernelError, KernelResult};

pub const ASCENDCL_LIBRARY_ENV: &str = "TRITON_JIT_ASCENDCL_LIBRARY";
pub const ASCEND_RUNTIME_LIBRARY_ENV: &str = "TRITON_JIT_ASCEND_RUNTIME_LIBRARY";

type AclError = i32;
type RtError = i32;

const ACL_SUCCESS: AclError = 0;
const RT_ERROR_NONE: RtError = 0;

/// Device binary magic numbers understood by `rtDevBinaryRegister`.
pub const RT_DEV_BINARY_MAGIC_ELF: u32 = 0x4355_4245;
pub const RT_DEV_BINARY_MAGIC_ELF_AIVEC: u32 = 0x4141_5246;
pub const RT_DEV_BINARY_MAGIC_ELF_AICUBE: u32 = 0x4149_4343;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
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
        }
    };
}

raw_handle!(
    /// An `aclrtStream`; the default value is the default stream.
    AclStream
);
raw_handle!(
    /// An `aclrtContext`.
    AclContext
);
raw_handle!(
    /// Handle returned by `rtDevBinaryRegister`.
    RtBinary
);
raw_handle!(
    /// Address of a registered function stub; what `rtKernelLaunch` takes.
    StubHandle
);

/// Host-side anchor for one registered kernel function.
///
/// The runtime identifies a kernel by the address of its stub, so the stub
/// must stay allocated for as long as the kernel may be launched.
pub struct FunctionStub {
    anchor: Box<u64>,
    stub_name: CString,
    kernel_name: CString,
}

impl FunctionStub {
    pub fn new(stub_name: &str, kernel_name: &str) -> KernelResult<Self> {
        let to_c = |name: &str| {
            CString::new(name).map_err(|_| {
                KernelError::invalid_argument(format!("kernel name '{name}' contains NUL byte"))
            })
        };
        Ok(Self {
            anchor: Box::new(0),
            stub_name: to_c(stub_name)?,
            kernel_name: to_c(kernel_name)?,
        })
    }

    pub fn handle(&self) -> StubHandle {
        StubHandle::from_addr(&*self.anchor as *const u64 as usize)
    }

    pub fn stub_name(&self) -> &str {
        self.stub_name.to_str().unwrap_or_default()
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel_name.to_str().unwrap_or_default()
    }
}

impl fmt::Debug for FunctionStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStub")
            .field("stub_name", &self.stub_name)
            .field("handle", &self.handle())
            .finish()
    }
}

/// The slice of AscendCL and the Ascend runtime the backend needs.
///
/// [`AscendDriver`] implements it over the vendor libraries; tests substitute fakes.
pub trait AscendApi: Send + Sync + 'static {
    fn current_context(&self) -> KernelResult<Option<AclContext>>;

    /// Binds `device`, creates a context on it and makes it current.
    fn create_context(&self, device: i32) -> KernelResult<AclContext>;

    fn destroy_context(&self, ctx: AclContext) -> KernelResult<()>;

    fn current_device(&self) -> KernelResult<i32>;

    /// Binds the runtime to `device` before registration.
    fn set_device(&self, device: i32) -> KernelResult<()>;

    fn register_binary(&self, image: &[u8], magic: u32) -> KernelResult<RtBinary>;

    fn register_function(&self, binary: RtBinary, stub: &FunctionStub) -> KernelResult<()>;

    /// Address of the cross-core control block (`ffts` address).
    fn c2c_ctrl_addr(&self) -> KernelResult<u64>;

    /// Enqueues the kernel registered under `stub` with a packed argument block.
    fn launch_kernel(
        &self,
        stub: StubHandle,
        block_num: u32,
        args: &[u8],
        stream: AclStream,
    ) -> KernelResult<()>;
}

#[repr(C)]
struct RtDevBinary {
    magic: u32,
    version: u32,
    data: *const c_void,
    length: u64,
}

type AclrtGetCurrentContextFn = unsafe extern "C" fn(ctx: *mut *mut c_void) -> AclError;
type AclrtSetCurrentContextFn = unsafe extern "C" fn(ctx: *mut c_void) -> AclError;
type AclrtCreateContextFn = unsafe extern "C" fn(ctx: *mut *mut c_void, device: i32) -> AclError;
type AclrtDestroyContextFn = unsafe extern "C" fn(ctx: *mut c_void) -> AclError;
type AclrtSetDeviceFn = unsafe extern "C" fn(device: i32) -> AclError;
type AclrtGetDeviceFn = unsafe extern "C" fn(device: *mut i32) -> AclError;

type RtSetDeviceFn = unsafe extern "C" fn(device: i32) -> RtError;
type RtDevBinaryRegisterFn =
    unsafe extern "C" fn(binary: *const RtDevBinary, handle: *mut *mut c_void) -> RtError;
type RtFunctionRegisterFn = unsafe extern "C" fn(
    bin_handle: *mut c_void,
    stub_func: *const c_void,
    stub_name: *const c_char,
    dev_func: *const c_void,
    func_mode: u32,
) -> RtError;
type RtGetC2cCtrlAddrFn = unsafe extern "C" fn(addr: *mut u64, len: *mut u32) -> RtError;
type RtKernelLaunchFn = unsafe extern "C" fn(
    stub_func: *const c_void,
    block_dim: u32,
    args: *mut c_void,
    args_size: u32,
    sm_desc: *mut c_void,
    stream: *mut c_void,
) -> RtError;

struct AclFns {
    get_current_context: AclrtGetCurrentContextFn,
    set_current_context: AclrtSetCurrentContextFn,
    create_context: AclrtCreateContextFn,
    destroy_context: AclrtDestroyContextFn,
    set_device: AclrtSetDeviceFn,
    get_device: AclrtGetDeviceFn,
}

struct RtFns {
    set_device: RtSetDeviceFn,
    dev_binary_register: RtDevBinaryRegisterFn,
    function_register: RtFunctionRegisterFn,
    get_c2c_ctrl_addr: RtGetC2cCtrlAddrFn,
    kernel_launch: RtKernelLaunchFn,
}

/// Dynamically loaded AscendCL and Ascend runtime.
pub struct AscendDriver {
    _acl: Library,
    _runtime: Library,
    acl: AclFns,
    rt: RtFns,
}

impl fmt::Debug for AscendDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AscendDriver").finish_non_exhaustive()
    }
}

static ASCEND_DRIVER: OnceLock<Result<Arc<AscendDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, loaded on first use.
pub fn driver() -> KernelResult<Arc<AscendDriver>> {
    let init = ASCEND_DRIVER.get_or_init(|| match AscendDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(KernelError::Unavailable {
            backend: "npu",
            reason: msg.clone(),
        }),
    }
}

impl AscendDriver {
    fn new() -> KernelResult<Self> {
        let acl_lib = load_library(ASCENDCL_LIBRARY_ENV, &["libascendcl.so"])?;
        let rt_lib = load_library(ASCEND_RUNTIME_LIBRARY_ENV, &["libruntime.so"])?;
        let acl = AclFns {
            get_current_context: load_symbol(&acl_lib, b"aclrtGetCurrentContext\0")?,
            set_current_context: load_symbol(&acl_lib, b"aclrtSetCurrentContext\0")?,
            create_context: load_symbol(&acl_lib, b"aclrtCreateContext\0")?,
            destroy_context: load_symbol(&acl_lib, b"aclrtDestroyContext\0")?,
            set_device: load_symbol(&acl_lib, b"aclrtSetDevice\0")?,
            get_device: load_symbol(&acl_lib, b"aclrtGetDevice\0")?,
        };
        let rt = RtFns {
            set_device: load_symbol(&rt_lib, b"rtSetDevice\0")?,
            dev_binary_register: load_symbol(&rt_lib, b"rtDevBinaryRegister\0")?,
            function_register: load_symbol(&rt_lib, b"rtFunctionRegister\0")?,
            get_c2c_ctrl_addr: load_symbol(&rt_lib, b"rtGetC2cCtrlAddr\0")?,
            kernel_launch: load_symbol(&rt_lib, b"rtKernelLaunch\0")?,
        };
        Ok(Self {
            _acl: acl_lib,
            _runtime: rt_lib,
            acl,
            rt,
        })
    }
}

fn check(code: i32, op: &'static str) -> KernelResult<()> {
    if code == ACL_SUCCESS {
        Ok(())
    } else {
        Err(KernelError::driver(op, code, format!("{op} returned {code}")))
    }
}

impl AscendApi for AscendDriver {
    fn current_context(&self) -> KernelResult<Option<AclContext>> {
        let mut ctx: *mut c_void = std::ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer.
        let code = unsafe { (self.acl.get_current_context)(&mut ctx) };
        if code != ACL_SUCCESS || ctx.is_null() {
            return Ok(None);
        }
        Ok(Some(AclContext::from_raw(ctx)))
    }

    fn create_context(&self, device: i32) -> KernelResult<AclContext> {
        let mut ctx: *mut c_void = std::ptr::null_mut();
        // SAFETY: plain value arguments and a valid out pointer.
        unsafe {
            check((self.acl.set_device)(device), "aclrtSetDevice")?;
            check((self.acl.create_context)(&mut ctx, device), "aclrtCreateContext")?;
            check((self.acl.set_current_context)(ctx), "aclrtSetCurrentContext")?;
        }
        Ok(AclContext::from_raw(ctx))
    }

    fn destroy_context(&self, ctx: AclContext) -> KernelResult<()> {
        // SAFETY: `ctx` came from `create_context` and is destroyed once by its owner.
        check(
            unsafe { (self.acl.destroy_context)(ctx.as_raw()) },
            "aclrtDestroyContext",
        )
    }

    fn current_device(&self) -> KernelResult<i32> {
        let mut device = -1;
        // SAFETY: `device` is a valid out pointer.
        check(unsafe { (self.acl.get_device)(&mut device) }, "aclrtGetDevice")?;
        Ok(device)
    }

    fn set_device(&self, device: i32) -> KernelResult<()> {
        // SAFETY: plain value argument.
        check(unsafe { (self.rt.set_device)(device) }, "rtSetDevice")
    }

    fn register_binary(&self, image: &[u8], magic: u32) -> KernelResult<RtBinary> {
        let binary = RtDevBinary {
            magic,
            version: 0,
            data: image.as_ptr() as *const c_void,
            length: image.len() as u64,
        };
        let mut handle: *mut c_void = std::ptr::null_mut();
        // SAFETY: descriptor and image outlive the call; the runtime copies the image.
        check(
            unsafe { (self.rt.dev_binary_register)(&binary, &mut handle) },
            "rtDevBinaryRegister",
        )?;
        Ok(RtBinary::from_raw(handle))
    }

    fn register_function(&self, binary: RtBinary, stub: &FunctionStub) -> KernelResult<()> {
        // SAFETY: the stub's anchor and names live as long as the cache entry that owns it.
        check(
            unsafe {
                (self.rt.function_register)(
                    binary.as_raw(),
                    stub.handle().as_raw() as *const c_void,
                    stub.stub_name.as_ptr(),
                    stub.kernel_name.as_ptr() as *const c_void,
                    0,
                )
            },
            "rtFunctionRegister",
        )
    }

    fn c2c_ctrl_addr(&self) -> KernelResult<u64> {
        let mut addr = 0u64;
        let mut len = 0u32;
        // SAFETY: both out pointers are valid.
        check(
            unsafe { (self.rt.get_c2c_ctrl_addr)(&mut addr, &mut len) },
            "rtGetC2cCtrlAddr",
        )?;
        Ok(addr)
    }

    fn launch_kernel(
        &self,
        stub: StubHandle,
        block_num: u32,
        args: &[u8],
        stream: AclStream,
    ) -> KernelResult<()> {
        let size = u32::try_from(args.len()).map_err(|_| {
            KernelError::invalid_argument(format!("argument block of {} bytes", args.len()))
        })?;
        // SAFETY: the stub was registered through `register_function`; the runtime
        // copies `size` bytes from `args` before returning.
        let code = unsafe {
            (self.rt.kernel_launch)(
                stub.as_raw() as *const c_void,
                block_num,
                args.as_ptr() as *mut c_void,
                size,
                std::ptr::null_mut(),
                stream.as_raw(),
            )
        };
        if code != RT_ERROR_NONE {
            return Err(KernelError::driver(
                "rtKernelLaunch",
                code,
                format!("rtKernelLaunch returned {code}"),
            ));
        }
        Ok(())
    }
}

fn load_library(env_key: &str, defaults: &[&str]) -> KernelResult<Library> {
    let overridden = non_empty_var(&[env_key]);
    let candidates: Vec<&str> = match overridden.as_deref() {
        Some(path) => vec![path],
        None => defaults.to_vec(),
    };

    for candidate in &candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            debug!("loaded {candidate}");
            return Ok(lib);
        }
    }

    Err(KernelError::Unavailable {
        backend: "npu",
        reason: format!("failed to load {}", candidates.join(", ")),
    })
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> KernelResult<T> {
    // SAFETY: Caller provides the expected symbol type from the vendor API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| KernelError::Unavailable {
        backend: "npu",
        reason: format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ),
    })?;
    Ok(*sym)
}
